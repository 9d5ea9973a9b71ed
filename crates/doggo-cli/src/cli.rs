//! CLI argument definitions for doggo
//!
//! Uses clap for argument parsing. This module defines all subcommands
//! and their options.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// doggo - fetch through whichever proxy you point at
///
/// A local HTTP proxy that forwards traffic directly or through a
/// selectable upstream proxy, switchable without restarting.
#[derive(Parser, Debug)]
#[command(name = "doggo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Silent mode - suppress banner and status output
    #[arg(long, short = 's', global = true)]
    pub silent: bool,

    /// Preference file to use instead of the default location
    #[arg(long, global = true, value_name = "FILE", env = "DOGGO_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the local proxy with an interactive console
    #[command(after_help = "EXAMPLES:
    # Serve on the stored port and start immediately
    doggo serve

    # Serve on another port with relay logging
    doggo serve --port 3128 --verbose

    # Open the console without starting the listener
    doggo serve --idle

CONSOLE COMMANDS:
    start, stop, select N, list, status, endpoint, port N, help, quit
")]
    Serve(ServeArgs),

    /// Manage the stored upstream proxy list
    #[command(after_help = "EXAMPLES:
    # Show all upstreams, the selected one marked
    doggo upstream list

    # Add an upstream with credentials
    doggo upstream add --name Office --host proxy.example --port 3128 --user alice

    # Add a direct entry
    doggo upstream add --name Home

    # Select the second entry
    doggo upstream select 1

    # Remove an entry
    doggo upstream remove 2
")]
    Upstream(UpstreamArgs),

    /// Show or change listener settings
    #[command(after_help = "EXAMPLES:
    # Print the current settings and file location
    doggo config show

    # Change the port and enable relay logging
    doggo config set --port 9000 --verbose true
")]
    Config(ConfigArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on (overrides the stored setting)
    #[arg(long, short = 'p', value_name = "PORT")]
    pub port: Option<u16>,

    /// Log every relayed connection
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Do not start the listener until `start` is typed
    #[arg(long)]
    pub idle: bool,
}

#[derive(Parser, Debug)]
pub struct UpstreamArgs {
    #[command(subcommand)]
    pub command: UpstreamCommands,
}

#[derive(Subcommand, Debug)]
pub enum UpstreamCommands {
    /// List stored upstreams
    List,
    /// Append an upstream
    Add(UpstreamDefinitionArgs),
    /// Replace the upstream at INDEX
    Edit {
        /// Position in the list (see `doggo upstream list`)
        index: usize,
        #[command(flatten)]
        definition: UpstreamDefinitionArgs,
    },
    /// Remove the upstream at INDEX
    Remove {
        /// Position in the list (see `doggo upstream list`)
        index: usize,
    },
    /// Make the upstream at INDEX the active one
    Select {
        /// Position in the list (see `doggo upstream list`)
        index: usize,
    },
}

/// Fields of one upstream entry. Without `--host` the entry is direct.
#[derive(Args, Debug, Clone)]
pub struct UpstreamDefinitionArgs {
    /// Display name
    #[arg(long)]
    pub name: String,

    /// Icon identifier shown next to the name
    #[arg(long)]
    pub icon: Option<String>,

    /// Upstream proxy host (omit for direct access)
    #[arg(long, requires = "port")]
    pub host: Option<String>,

    /// Upstream proxy port
    #[arg(long, requires = "host")]
    pub port: Option<u16>,

    /// User for proxy authentication
    #[arg(long, requires = "host")]
    pub user: Option<String>,

    /// Password for proxy authentication
    #[arg(
        long,
        requires = "user",
        env = "DOGGO_UPSTREAM_PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the stored listener settings
    Show,
    /// Update listener settings
    Set {
        /// Port the proxy listens on
        #[arg(long)]
        port: Option<u16>,

        /// Log every relayed connection
        #[arg(long, value_name = "BOOL")]
        verbose: Option<bool>,
    },
}
