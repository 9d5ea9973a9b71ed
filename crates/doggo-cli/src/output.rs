//! CLI output styling for doggo

use colored::Colorize;
use doggo_proxy::{ProxyPreference, ServerStatus, StatusReport, UpstreamDefinition, UpstreamsPreference};
use rand::prelude::IndexedRandom;
use std::path::Path;

/// Dog puns for the banner
const QUOTES: &[&str] = &[
    "Who's a good proxy?",
    "Fetching packets since boot",
    "Sit. Stay. Forward.",
    "Much proxy. Very upstream. Wow.",
    "Every packet gets a walk",
    "No bytes left behind",
    "Barking up the right upstream",
    "Good boy, good route",
];

/// Print the doggo banner
pub fn print_banner(silent: bool) {
    if silent {
        return;
    }

    let quote = QUOTES
        .choose(&mut rand::rng())
        .unwrap_or(&"Who's a good proxy?");

    let version = env!("CARGO_PKG_VERSION");

    let dog = "U\u{30FB}\u{1D25}\u{30FB}U".truecolor(194, 150, 90); // U・ᴥ・U
    let title = "doggo".truecolor(204, 102, 0).bold();
    let ver = format!("v{}", version).white();

    eprintln!();
    eprintln!(" {} {} {}", dog, title, ver);
    eprintln!("           - {}", quote.truecolor(150, 150, 150));
    eprintln!();
}

fn status_label(status: ServerStatus) -> colored::ColoredString {
    match status {
        ServerStatus::Running => "running".green().bold(),
        ServerStatus::Stopped => "stopped".red().bold(),
    }
}

/// Print a status transition, the console's equivalent of a tray icon change.
pub fn print_status_change(status: ServerStatus, silent: bool) {
    if silent {
        return;
    }
    eprintln!("{} proxy {}", "\u{25CF}".truecolor(204, 102, 0), status_label(status));
}

/// Print the full status report.
pub fn print_report(report: &StatusReport) {
    eprintln!("  {} {}", "Status:".white().bold(), status_label(report.status));
    eprintln!(
        "  {} {}",
        "Endpoint:".white().bold(),
        report.endpoint.as_deref().unwrap_or("(not configured)")
    );
    if let Some(addr) = report.local_addr {
        eprintln!("  {} {}", "Listening:".white().bold(), addr);
    }
    eprintln!(
        "  {} {}",
        "Upstream:".white().bold(),
        report.upstream.as_deref().unwrap_or("Direct Access")
    );
}

/// One line of the upstream list, without colors.
pub fn upstream_line(index: usize, definition: &UpstreamDefinition, selected: bool) -> String {
    let marker = if selected { "*" } else { " " };
    let icon = definition
        .icon
        .as_deref()
        .map(|icon| format!(" [{}]", icon))
        .unwrap_or_default();
    let auth = match definition.connection_setting {
        Some(ref target) if target.credentials.is_some() => " (auth)",
        _ => "",
    };
    format!(
        "{} {:>2}  {}{}  {}{}",
        marker,
        index,
        definition.name,
        icon,
        definition.summary(),
        auth
    )
}

/// Print the stored upstream list, the selected entry marked.
pub fn print_upstreams(pref: &UpstreamsPreference) {
    if pref.upstreams.is_empty() {
        eprintln!("  {}", "(no upstreams defined)".truecolor(150, 150, 150));
        return;
    }
    for (index, definition) in pref.upstreams.iter().enumerate() {
        let line = upstream_line(index, definition, index == pref.selected_index);
        if index == pref.selected_index {
            eprintln!("{}", line.green());
        } else {
            eprintln!("{}", line);
        }
    }
}

/// Print the confirmation for a selection change.
pub fn print_selected(index: usize, name: &str, summary: &str) {
    eprintln!(
        "{} {} {} ({})",
        "Selected".green(),
        index,
        name.white().bold(),
        summary
    );
}

/// Print stored listener settings.
pub fn print_proxy_preference(pref: &ProxyPreference, path: &Path) {
    eprintln!("  {} {}", "Port:".white().bold(), pref.port);
    eprintln!("  {} {}", "Verbose:".white().bold(), pref.verbose);
    eprintln!(
        "  {} {}",
        "File:".white().bold(),
        path.display().to_string().truecolor(150, 150, 150)
    );
}

/// Print the console command reference.
pub fn print_console_help() {
    eprintln!("{}", "Commands:".white().bold());
    for (cmd, help) in [
        ("start", "start listening"),
        ("stop", "stop listening and drop open connections"),
        ("select N", "route new connections through upstream N"),
        ("list", "show stored upstreams"),
        ("status", "show status, endpoint and upstream"),
        ("endpoint", "show the proxy address"),
        ("port N", "move the listener to port N"),
        ("help", "show this list"),
        ("quit", "stop and exit"),
    ] {
        eprintln!("  {:<10} {}", cmd.truecolor(204, 102, 0), help);
    }
}
