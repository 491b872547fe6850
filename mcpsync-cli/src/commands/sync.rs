//! `mcpsync sync` and `mcpsync preview`

use std::path::Path;

use anyhow::{bail, Result};
use clap::Args;
use serde::Deserialize;

use mcpsync_daemon::DaemonRequest;
use mcpsync_sync::{ChangeKind, MultiSyncResult, SyncOptions, SyncPreview, SyncResult};

use super::request;

/// Arguments for `mcpsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Destination ids to sync (omit when using `--all`).
    pub destinations: Vec<String>,

    /// Sync every registered destination.
    #[arg(long, conflicts_with = "destinations")]
    pub all: bool,

    /// Show what would change without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Back destination files up before overwriting them.
    #[arg(long, conflicts_with = "dry_run")]
    pub backup: bool,
}

impl SyncArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let options = SyncOptions {
            dry_run: self.dry_run,
            backup: self.backup,
        };

        let multi: MultiSyncResult = if self.all {
            request(home, DaemonRequest::SyncAll { options })?
        } else if let [destination] = self.destinations.as_slice() {
            let result: SyncResult = request(
                home,
                DaemonRequest::SyncTo {
                    destination: destination.clone(),
                    options,
                },
            )?;
            print_result(&result);
            return finish(usize::from(!result.success));
        } else if self.destinations.is_empty() {
            bail!("provide destination ids or use --all");
        } else {
            request(
                home,
                DaemonRequest::SyncToMultiple {
                    destinations: self.destinations,
                    options,
                },
            )?
        };

        for result in &multi.results {
            print_result(result);
        }
        println!(
            "{} succeeded, {} failed in {}ms",
            multi.success_count, multi.failure_count, multi.duration_ms
        );
        finish(multi.failure_count)
    }
}

fn finish(failures: usize) -> Result<()> {
    if failures > 0 {
        bail!("{failures} destination(s) failed to sync");
    }
    Ok(())
}

fn print_result(result: &SyncResult) {
    let prefix = if result.dry_run { "[dry-run] " } else { "" };
    if let Some(error) = result.fatal_error() {
        println!("{prefix}✗ '{}' failed: {error}", result.destination);
        return;
    }
    if result.changes.is_empty() {
        println!("{prefix}✓ '{}' nothing to do", result.destination);
    } else {
        println!(
            "{prefix}✓ '{}' synced ({} added, {} updated, {} removed)",
            result.destination,
            result.count(ChangeKind::Add),
            result.count(ChangeKind::Update),
            result.count(ChangeKind::Remove),
        );
    }
    for issue in &result.errors {
        println!("  !  {}", issue.message);
    }
    if let Some(backup) = &result.backup_path {
        println!("  ⤷  backup {}", backup.display());
    }
}

/// Arguments for `mcpsync preview`.
#[derive(Args, Debug)]
pub struct PreviewArgs {
    /// Destination ids to preview; all registered destinations when omitted.
    pub destinations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PreviewList {
    previews: Vec<SyncPreview>,
}

impl PreviewArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let list: PreviewList = request(
            home,
            DaemonRequest::PreviewSync {
                destinations: self.destinations,
            },
        )?;
        for preview in &list.previews {
            if let Some(error) = preview.result.fatal_error() {
                println!("✗ '{}': {error}", preview.result.destination);
            } else if preview.diff.is_empty() {
                println!("· '{}' is up to date", preview.result.destination);
            } else {
                print!("{}", preview.diff);
            }
        }
        Ok(())
    }
}
