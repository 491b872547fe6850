//! `mcpsync autosync start|stop|status`

use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Subcommand};

use mcpsync_core::AutoSyncSettings;
use mcpsync_daemon::{AutoSyncStatus, DaemonRequest};

use super::request;

#[derive(Subcommand, Debug)]
pub enum AutoSyncCommand {
    /// Sync automatically whenever the server config changes.
    Start(StartArgs),
    /// Stop automatic syncing; it stays off across daemon restarts.
    Stop,
    /// Show auto-sync state.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Quiet period after the last change before syncing.
    #[arg(long, value_name = "MS")]
    pub debounce_ms: Option<u64>,

    /// Also poll the config file on this interval (0 disables polling).
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Only sync these destinations; repeatable.
    #[arg(long = "destination", value_name = "ID")]
    pub destinations: Vec<String>,

    /// Never sync these destinations; repeatable.
    #[arg(long = "exclude", value_name = "ID")]
    pub exclude: Vec<String>,
}

impl StartArgs {
    /// `None` keeps whatever the daemon has persisted.
    fn settings(self) -> Option<AutoSyncSettings> {
        if self.debounce_ms.is_none()
            && self.interval_ms.is_none()
            && self.destinations.is_empty()
            && self.exclude.is_empty()
        {
            return None;
        }
        let defaults = AutoSyncSettings::default();
        Some(AutoSyncSettings {
            enabled: true,
            interval_ms: self.interval_ms.unwrap_or(defaults.interval_ms),
            debounce_ms: self.debounce_ms.unwrap_or(defaults.debounce_ms),
            destinations: self.destinations,
            exclude: self.exclude,
        })
    }
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print the raw JSON status.
    #[arg(long)]
    pub json: bool,
}

pub fn run(home: &Path, command: AutoSyncCommand) -> Result<()> {
    match command {
        AutoSyncCommand::Start(args) => {
            let status: AutoSyncStatus = request(
                home,
                DaemonRequest::StartAutoSync {
                    settings: args.settings(),
                },
            )?;
            println!("✓ auto-sync {}", status.phase.label());
            print_status(&status);
        }
        AutoSyncCommand::Stop => {
            let status: AutoSyncStatus = request(home, DaemonRequest::StopAutoSync)?;
            println!("✓ auto-sync {}", status.phase.label());
        }
        AutoSyncCommand::Status(args) => {
            let status: AutoSyncStatus = request(home, DaemonRequest::GetAutoSyncStatus)?;
            if args.json {
                return super::print_json(&status);
            }
            println!("auto-sync {}", status.phase.label());
            print_status(&status);
        }
    }
    Ok(())
}

fn print_status(status: &AutoSyncStatus) {
    println!("  enabled      {}", status.enabled);
    println!("  debounce     {}ms", status.debounce_ms);
    if status.interval_ms > 0 {
        println!("  poll every   {}ms", status.interval_ms);
    }
    if let Some(path) = &status.watching {
        println!("  watching     {}", path.display());
    }
    let targets = if status.destinations.is_empty() {
        "all".to_string()
    } else {
        status.destinations.join(", ")
    };
    println!("  destinations {targets}");
    if !status.exclude.is_empty() {
        println!("  excluded     {}", status.exclude.join(", "));
    }
    match status.last_sync {
        Some(at) => {
            let ago = (Utc::now() - at).num_seconds().max(0);
            println!("  last sync    {} ({ago}s ago, {} total)", at.to_rfc3339(), status.sync_count);
        }
        None => println!("  last sync    never"),
    }
}
