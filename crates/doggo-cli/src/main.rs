//! doggo CLI - local proxy with switchable upstreams
//!
//! This is the CLI binary that drives the doggo-proxy library.

mod cli;
mod config;
mod console;
mod output;

use clap::Parser;
use cli::{Cli, Commands, ConfigCommands, ServeArgs, UpstreamCommands, UpstreamDefinitionArgs};
use colored::Colorize;
use config::FilePreferenceStore;
use doggo_proxy::command::{self, CommandHandler};
use doggo_proxy::{
    Command, CommandResponse, PreferenceStore, ProxyController, ProxyError, Result,
    UpstreamDefinition, UpstreamSelector, UpstreamTarget,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = match cli.command {
        Commands::Serve(ServeArgs { verbose: true, .. }) => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("doggo: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let path = config::preferences_path(cli.config.as_deref())?;
    let store = FilePreferenceStore::new(path);

    match cli.command {
        Commands::Serve(args) => {
            output::print_banner(cli.silent);
            run_serve(args, store, cli.silent)
        }
        Commands::Upstream(args) => run_upstream(args.command, &store),
        Commands::Config(args) => run_config(args.command, &store),
    }
}

/// Serve the proxy with an interactive console
fn run_serve(args: ServeArgs, store: FilePreferenceStore, silent: bool) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(ProxyError::Io)?;

    let result = rt.block_on(serve(args, store, silent));
    // Don't wait on tasks parked in blocking reads.
    rt.shutdown_background();
    result
}

async fn serve(args: ServeArgs, store: FilePreferenceStore, silent: bool) -> Result<()> {
    let stored = store.proxy_preference()?;
    let port = args.port.unwrap_or(stored.port);
    let verbose = args.verbose || stored.verbose;

    let controller = Arc::new(ProxyController::new(Arc::new(UpstreamSelector::new())));
    controller.on_status_change(move |status| output::print_status_change(status, silent));
    controller.configure(port, verbose).await?;

    let handler = CommandHandler::new(Arc::clone(&controller), store);
    handler.sync_selected_upstream()?;
    let client = command::spawn(handler);

    if args.idle {
        info!("Listener idle until 'start'");
    } else {
        client.send(Command::StartServer).await?;
    }

    if !silent {
        if let CommandResponse::Status(report) = client.send(Command::Status).await? {
            output::print_report(&report);
        }
    }

    let lines = console::spawn_stdin_reader()?;
    console::run(
        client,
        console::Session { verbose, silent },
        lines,
        tokio::signal::ctrl_c(),
    )
    .await
}

/// Manage the stored upstream list
fn run_upstream(command: UpstreamCommands, store: &FilePreferenceStore) -> Result<()> {
    match command {
        UpstreamCommands::List => {
            output::print_upstreams(&store.upstreams_preference()?);
        }
        UpstreamCommands::Add(args) => {
            let definition = definition_from_args(args);
            let index = store.update(|prefs| prefs.upstreams.add(definition))?;
            eprintln!("{} upstream {}", "Added".green(), index);
        }
        UpstreamCommands::Edit { index, definition } => {
            let definition = definition_from_args(definition);
            store.update(|prefs| prefs.upstreams.edit(index, definition))?;
            eprintln!("{} upstream {}", "Updated".green(), index);
        }
        UpstreamCommands::Remove { index } => {
            let removed = store.update(|prefs| prefs.upstreams.remove(index))?;
            eprintln!("{} {}", "Removed".green(), removed.name.white().bold());
        }
        UpstreamCommands::Select { index } => {
            let selected = store.update(|prefs| prefs.upstreams.select(index).cloned())?;
            output::print_selected(index, &selected.name, &selected.summary());
        }
    }
    Ok(())
}

fn definition_from_args(args: UpstreamDefinitionArgs) -> UpstreamDefinition {
    let target = args.host.zip(args.port).map(|(host, port)| {
        let target = UpstreamTarget::new(host, port);
        match args.user {
            Some(user) => target.with_credentials(user, args.password.unwrap_or_default()),
            None => target,
        }
    });
    UpstreamDefinition {
        name: args.name,
        icon: args.icon,
        connection_setting: target,
    }
}

/// Show or change listener settings
fn run_config(command: ConfigCommands, store: &FilePreferenceStore) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            output::print_proxy_preference(&store.proxy_preference()?, store.path());
        }
        ConfigCommands::Set { port, verbose } => {
            if port == Some(0) {
                return Err(ProxyError::Validation(
                    "port must be between 1 and 65535".to_string(),
                ));
            }
            let mut updated = store.proxy_preference()?;
            if let Some(port) = port {
                updated.port = port;
            }
            if let Some(verbose) = verbose {
                updated.verbose = verbose;
            }
            store.set_proxy_preference(updated)?;
            output::print_proxy_preference(&updated, store.path());
        }
    }
    Ok(())
}
