//! `mcpsync destination list|add|remove`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Deserialize;

use mcpsync_daemon::DaemonRequest;
use mcpsync_sync::{file_destination::DEFAULT_SERVERS_KEY, DestinationInfo, FileDestinationSpec};

use super::request;

#[derive(Subcommand, Debug)]
pub enum DestinationCommand {
    /// List destinations registered with the daemon.
    List,

    /// Register a JSON config file as a destination.
    Add(AddArgs),

    /// Unregister a destination. The file itself is left alone.
    Remove {
        /// Destination id.
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Identifier used by `sync` and auto-sync filters.
    pub id: String,

    /// Path of the JSON file to keep in sync.
    pub path: PathBuf,

    /// Top-level key holding the server map.
    #[arg(long, default_value = DEFAULT_SERVERS_KEY)]
    pub servers_key: String,

    /// Free-form description shown by `list`.
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DestinationList {
    destinations: Vec<DestinationInfo>,
}

#[derive(Debug, Deserialize)]
struct IdReply {
    id: String,
}

pub fn run(home: &Path, command: DestinationCommand) -> Result<()> {
    match command {
        DestinationCommand::List => {
            let list: DestinationList = request(home, DaemonRequest::ListDestinations)?;
            if list.destinations.is_empty() {
                println!("No destinations registered.");
                println!("Run: mcpsync destination add <id> <path>");
            }
            for info in &list.destinations {
                println!("  {:<20} {}", info.id, info.description);
            }
        }
        DestinationCommand::Add(args) => {
            // The daemon resolves paths against its own working directory.
            let path = if args.path.is_absolute() {
                args.path
            } else {
                std::env::current_dir()
                    .context("cannot read the working directory")?
                    .join(&args.path)
            };
            let spec = FileDestinationSpec {
                id: args.id,
                path,
                servers_key: args.servers_key,
                description: args.description,
            };
            let reply: IdReply = request(home, DaemonRequest::RegisterDestination { destination: spec })?;
            println!("✓ registered destination '{}'", reply.id);
        }
        DestinationCommand::Remove { id } => {
            let reply: IdReply = request(home, DaemonRequest::RemoveDestination { id })?;
            println!("✓ removed destination '{}'", reply.id);
        }
    }
    Ok(())
}
