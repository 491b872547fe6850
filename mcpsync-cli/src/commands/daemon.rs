//! `mcpsync daemon`: foreground daemon and its lifecycle RPCs.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use mcpsync_daemon::{paths, start_blocking, ClientError, DaemonSettings};

use super::{block_on, client, print_json};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until stopped.
    Start(StartArgs),
    /// Ask a running daemon to shut down gracefully.
    Stop,
    /// Query daemon runtime status.
    Status,
    /// Print recent daemon log lines.
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Stop after this many idle milliseconds (0 disables).
    #[arg(long, value_name = "MS")]
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,
}

pub fn run(home: &Path, command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Start(args) => {
            let mut settings = DaemonSettings::load(home).context("failed to load daemon config")?;
            if let Some(log_file) = args.log_file {
                settings.log_file = Some(log_file);
            }
            if let Some(ms) = args.idle_timeout_ms {
                settings.idle_timeout = std::time::Duration::from_millis(ms);
            }
            start_blocking(settings).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => {
            let client = client(home)?;
            match block_on(client.shutdown())? {
                Ok(()) => println!("daemon stop requested"),
                Err(ClientError::Unavailable { .. }) => println!("daemon is not running"),
                Err(err) => return Err(err).context("failed to stop daemon"),
            }
        }
        DaemonCommand::Status => {
            let client = client(home)?;
            match block_on(client.status())? {
                Ok(status) => print_json(&status)?,
                Err(ClientError::Unavailable { .. }) => print_json(&serde_json::json!({
                    "running": false,
                    "listen": client.addr().to_string(),
                }))?,
                Err(err) => return Err(err).context("failed to query daemon status"),
            }
        }
        DaemonCommand::Logs(args) => {
            let settings = DaemonSettings::load(home).context("failed to load daemon config")?;
            let path = settings.log_file.unwrap_or_else(|| paths::log_path(home));
            print_tail(&path, args.lines).context("failed to read daemon log")?;
        }
    }

    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut tail = VecDeque::<String>::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
