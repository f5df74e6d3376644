use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber;

use netguard::command;
use netguard::config::NetguardConfig;
use netguard::engine::Controller;

/// Interactive console for the Netguard access-control engine.
///
/// Reads UFW-style commands from stdin and executes them against an
/// in-memory engine; `eval <src> <dst> <port> [proto]` exercises the
/// decision pipeline directly.
#[derive(Debug, Parser)]
#[command(name = "netguard", version, about)]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity for the process itself (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info")]
    verbosity: Level,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(args.verbosity)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Netguard console");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match args.config {
        Some(path) => NetguardConfig::from_file(&path)?,
        None => NetguardConfig::default(),
    };
    info!(
        default_policy = %config.default_policy,
        log_level = %config.log_level,
        profiles = config.profiles.len(),
        "Configuration loaded"
    );

    let controller = Controller::from_config(&config);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("> ");
    stdout.flush()?;

    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            print!("> ");
            stdout.flush()?;
            continue;
        }
        if trimmed == "quit" || trimmed == "exit" {
            break;
        }

        match command::parse(trimmed).and_then(|cmd| command::execute(&controller, cmd, Utc::now()))
        {
            Ok(output) => println!("{}", output),
            Err(e) => println!("error: {}", e),
        }

        print!("> ");
        stdout.flush()?;
    }

    info!("Netguard console stopped");
    Ok(())
}
