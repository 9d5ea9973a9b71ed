//! Interactive console for `doggo serve`.
//!
//! Reads one command per line from stdin and forwards it to the command
//! handler. Errors are printed and the console keeps going; only `quit`,
//! Ctrl-C, or a failed command channel end the loop. When stdin closes
//! (e.g. `doggo serve < /dev/null`) the proxy keeps serving until Ctrl-C.
//!
//! Stdin is read on a plain thread feeding a channel. A blocking read on a
//! runtime thread would keep the runtime from shutting down after Ctrl-C.

use crate::output;
use colored::Colorize;
use doggo_proxy::{Command, CommandClient, CommandResponse, ProxyError, Result};
use std::future::Future;
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::debug;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send(Command),
    /// Move the listener; verbosity is carried over from the session.
    Port(u16),
    Help,
    Quit,
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> std::result::Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for '{}'", word));
    }

    let command = match (word.to_ascii_lowercase().as_str(), arg) {
        ("start", None) => ConsoleCommand::Send(Command::StartServer),
        ("stop", None) => ConsoleCommand::Send(Command::StopServer),
        ("list" | "ls", None) => ConsoleCommand::Send(Command::ListUpstreams),
        ("status", None) => ConsoleCommand::Send(Command::Status),
        ("endpoint", None) => ConsoleCommand::Send(Command::Endpoint),
        ("select", Some(n)) => ConsoleCommand::Send(Command::SelectUpstream {
            index: n
                .parse()
                .map_err(|_| format!("'{}' is not an upstream index", n))?,
        }),
        ("port", Some(n)) => ConsoleCommand::Port(
            n.parse()
                .map_err(|_| format!("'{}' is not a port number", n))?,
        ),
        ("help" | "?", None) => ConsoleCommand::Help,
        ("quit" | "exit", None) => ConsoleCommand::Quit,
        ("select" | "port", None) => return Err(format!("'{}' needs a number", word)),
        (other, _) => return Err(format!("unknown command '{}' (try 'help')", other)),
    };
    Ok(Some(command))
}

/// Session state the console keeps between lines.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub verbose: bool,
    pub silent: bool,
}

/// Start a detached thread forwarding stdin lines into a channel.
///
/// The channel closes at end of input or on a read error. The thread is
/// never joined; it dies with the process.
pub fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("doggo-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })
        .map_err(ProxyError::Io)?;
    Ok(rx)
}

/// Run the console until `quit` or `shutdown` resolves (Ctrl-C in `serve`).
pub async fn run<F>(
    client: CommandClient,
    session: Session,
    mut lines: mpsc::Receiver<String>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    if !session.silent {
        eprintln!("Type 'help' for commands.");
    }

    tokio::pin!(shutdown);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.recv(), if stdin_open => {
                match line {
                    Some(line) => {
                        if !dispatch(&client, &line, session).await? {
                            break;
                        }
                    }
                    None => {
                        debug!("stdin closed, serving until Ctrl-C");
                        stdin_open = false;
                    }
                }
            }
            signal = &mut shutdown => {
                signal?;
                debug!("Shutdown requested");
                break;
            }
        }
    }

    client.send(Command::StopServer).await?;
    Ok(())
}

/// Execute one line. Returns `false` when the console should exit.
async fn dispatch(client: &CommandClient, line: &str, session: Session) -> Result<bool> {
    let command = match parse_line(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(true),
        Err(message) => {
            eprintln!("{}", message.yellow());
            return Ok(true);
        }
    };

    let request = match command {
        ConsoleCommand::Quit => return Ok(false),
        ConsoleCommand::Help => {
            output::print_console_help();
            return Ok(true);
        }
        ConsoleCommand::Port(port) => Command::Reconfigure {
            port,
            verbose: session.verbose,
        },
        ConsoleCommand::Send(request) => request,
    };

    match client.send(request).await {
        Ok(response) => print_response(&response),
        Err(ProxyError::Shutdown) => return Err(ProxyError::Shutdown),
        Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
    }
    Ok(true)
}

fn print_response(response: &CommandResponse) {
    match response {
        CommandResponse::Status(report) => output::print_report(report),
        CommandResponse::Selected {
            index,
            name,
            summary,
        } => output::print_selected(*index, name, summary),
        CommandResponse::Upstreams(pref) => output::print_upstreams(pref),
        CommandResponse::Running { running } => eprintln!("  running: {}", running),
        CommandResponse::Endpoint { endpoint } => {
            eprintln!("  {}", endpoint.as_deref().unwrap_or("(not configured)"))
        }
    }
}
