//! mcpsync: keep MCP server definitions in sync across tools.
//!
//! # Usage
//!
//! ```text
//! mcpsync daemon start|stop|status|logs
//! mcpsync server list
//! mcpsync server add <name> (--command <cmd> [--arg ..] [--env K=V ..] | --url <url> [--header K=V ..])
//! mcpsync server remove <name>
//! mcpsync destination list|add|remove
//! mcpsync sync [<destination>..] [--all] [--dry-run] [--backup]
//! mcpsync preview [<destination>..]
//! mcpsync autosync start|stop|status
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    autosync::AutoSyncCommand, daemon::DaemonCommand, destination::DestinationCommand,
    server::ServerCommand, sync::PreviewArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "mcpsync",
    version,
    about = "Keep MCP server definitions in sync across tools",
    long_about = None,
)]
struct Cli {
    /// Root directory holding `.mcpsync/` (defaults to $MCPSYNC_HOME, then $HOME).
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run, stop and inspect the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Manage server definitions held by the daemon.
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },

    /// Manage the files servers are synced into.
    Destination {
        #[command(subcommand)]
        command: DestinationCommand,
    },

    /// Write the current servers to one, several or all destinations.
    Sync(SyncArgs),

    /// Show what a sync would change, as a unified diff.
    Preview(PreviewArgs),

    /// Start, stop and inspect automatic syncing on config changes.
    Autosync {
        #[command(subcommand)]
        command: AutoSyncCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = commands::resolve_home(cli.home)?;
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(&home, command),
        Commands::Server { command } => commands::server::run(&home, command),
        Commands::Destination { command } => commands::destination::run(&home, command),
        Commands::Sync(args) => args.run(&home),
        Commands::Preview(args) => args.run(&home),
        Commands::Autosync { command } => commands::autosync::run(&home, command),
    }
}
