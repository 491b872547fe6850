//! Single-destination sync: transform → backup → diff → write.

use std::time::Instant;

use mcpsync_core::Config;

use crate::destination::{Destination, ServerEntries};
use crate::diff::{self, Rendered};
use crate::result::{SyncIssue, SyncOptions, SyncResult};

/// Sync `config` into one destination.
///
/// Never returns an error: every failure is recorded in the result. Transform,
/// serialize, read and write failures are fatal (nothing is written); a
/// backup failure is recoverable.
pub fn sync_to(destination: &dyn Destination, config: &Config, options: &SyncOptions) -> SyncResult {
    run(destination, config, options).0
}

/// Dry-run `config` into one destination and also render a unified diff of
/// the current vs. would-be entries.
pub fn preview(destination: &dyn Destination, config: &Config) -> (SyncResult, String) {
    let (result, current, next) = run(destination, config, &SyncOptions::dry_run());
    let diff = match next {
        Some(next) => diff::unified(destination.id(), current.as_ref(), &next),
        None => String::new(),
    };
    (result, diff)
}

fn run(
    destination: &dyn Destination,
    config: &Config,
    options: &SyncOptions,
) -> (SyncResult, Option<ServerEntries>, Option<ServerEntries>) {
    let started = Instant::now();
    let id = destination.id();
    let mut result = SyncResult::begin(id, options.dry_run);

    let servers = config.servers_for(id);
    let entries = match destination.transform(&servers) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("transform failed for {id}: {e}");
            return (fatal(result, format!("transform: {e}"), started), None, None);
        }
    };
    let next = match Rendered::new(entries) {
        Ok(rendered) => rendered,
        Err(e) => {
            return (fatal(result, format!("serialize: {e}"), started), None, None);
        }
    };

    if options.backup && !options.dry_run && destination.supports_backup() && destination.exists() {
        match destination.backup() {
            Ok(path) => result.backup_path = Some(path),
            Err(e) => {
                tracing::warn!("backup failed for {id}: {e}");
                result.errors.push(SyncIssue {
                    message: format!("backup: {e}"),
                    recoverable: true,
                });
            }
        }
    }

    let current = match destination.read() {
        Ok(current) => current,
        Err(e) => {
            let next = next.into_entries();
            return (fatal(result, format!("read: {e}"), started), None, Some(next));
        }
    };
    let current = match current.map(Rendered::new).transpose() {
        Ok(current) => current,
        Err(e) => {
            let next = next.into_entries();
            return (fatal(result, format!("serialize existing: {e}"), started), None, Some(next));
        }
    };

    result.changes = diff::compute_changes(current.as_ref(), &next);

    if !options.dry_run && !result.changes.is_empty() {
        if let Err(e) = destination.write(next.entries()) {
            tracing::warn!("write failed for {id}: {e}");
            let current = current.map(Rendered::into_entries);
            return (
                fatal(result, format!("write: {e}"), started),
                current,
                Some(next.into_entries()),
            );
        }
    }

    tracing::debug!(
        "{id}: {} change(s){}",
        result.changes.len(),
        if options.dry_run { " (dry run)" } else { "" }
    );
    let current = current.map(Rendered::into_entries);
    (result.finish(started.elapsed()), current, Some(next.into_entries()))
}

fn fatal(mut result: SyncResult, message: String, started: Instant) -> SyncResult {
    result.errors.push(SyncIssue {
        message,
        recoverable: false,
    });
    result.finish(started.elapsed())
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory destinations with scriptable failures.

    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use parking_lot::Mutex;
    use serde_json::json;

    use mcpsync_core::{ServerConfig, ServerName, Transport};

    use crate::destination::{Destination, ServerEntries};
    use crate::error::DestinationError;

    #[derive(Default)]
    pub struct MemoryDestination {
        pub id: String,
        pub content: Mutex<Option<ServerEntries>>,
        pub writes: Mutex<usize>,
        pub backups: Mutex<usize>,
        pub fail_transform: bool,
        pub fail_write: bool,
        pub fail_backup: bool,
    }

    impl MemoryDestination {
        pub fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                ..Default::default()
            }
        }

        pub fn with_content(self, content: ServerEntries) -> Self {
            *self.content.lock() = Some(content);
            self
        }

        pub fn content(&self) -> Option<ServerEntries> {
            self.content.lock().clone()
        }
    }

    impl Destination for MemoryDestination {
        fn id(&self) -> &str {
            &self.id
        }

        fn description(&self) -> String {
            format!("memory destination {}", self.id)
        }

        fn transform(
            &self,
            servers: &BTreeMap<ServerName, ServerConfig>,
        ) -> Result<ServerEntries, DestinationError> {
            if self.fail_transform {
                return Err(DestinationError::Transform("unsupported transport".into()));
            }
            Ok(servers
                .iter()
                .map(|(name, server)| {
                    let value = match &server.transport {
                        Transport::Stdio { command, .. } => json!({ "command": command }),
                        Transport::Http { url, .. } => json!({ "url": url }),
                    };
                    (name.0.clone(), value)
                })
                .collect())
        }

        fn read(&self) -> Result<Option<ServerEntries>, DestinationError> {
            Ok(self.content())
        }

        fn write(&self, entries: &ServerEntries) -> Result<(), DestinationError> {
            if self.fail_write {
                return Err(DestinationError::Transform("disk full".into()));
            }
            *self.content.lock() = Some(entries.clone());
            *self.writes.lock() += 1;
            Ok(())
        }

        fn exists(&self) -> bool {
            self.content.lock().is_some()
        }

        fn supports_backup(&self) -> bool {
            true
        }

        fn backup(&self) -> Result<PathBuf, DestinationError> {
            if self.fail_backup {
                return Err(DestinationError::Transform("backup target unavailable".into()));
            }
            *self.backups.lock() += 1;
            Ok(PathBuf::from(format!("/backups/{}", self.id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryDestination;
    use super::*;
    use crate::result::ChangeKind;
    use mcpsync_core::{ServerConfig, ServerName, Transport};
    use serde_json::json;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        for (name, command) in pairs {
            config
                .servers
                .insert(ServerName::from(*name), ServerConfig::new(Transport::stdio(*command)));
        }
        config
    }

    fn entries(pairs: &[(&str, &str)]) -> ServerEntries {
        pairs
            .iter()
            .map(|(n, c)| (n.to_string(), json!({ "command": c })))
            .collect()
    }

    #[test]
    fn empty_destination_gets_every_server_as_add() {
        let dest = MemoryDestination::new("d");
        let result = sync_to(&dest, &config(&[("a", "x"), ("b", "y")]), &SyncOptions::default());
        assert!(result.success);
        assert_eq!(result.count(ChangeKind::Add), 2);
        assert_eq!(dest.content(), Some(entries(&[("a", "x"), ("b", "y")])));
    }

    #[test]
    fn changed_command_is_one_update_only() {
        let dest = MemoryDestination::new("d").with_content(entries(&[("a", "y")]));
        let result = sync_to(&dest, &config(&[("a", "x")]), &SyncOptions::default());
        assert!(result.success);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.count(ChangeKind::Update), 1);
        assert_eq!(result.changes[0].server, "a");
    }

    #[test]
    fn dry_run_never_mutates_and_predicts_the_real_sync() {
        let dest = MemoryDestination::new("d").with_content(entries(&[("a", "y"), ("old", "z")]));
        let cfg = config(&[("a", "x"), ("b", "w")]);

        let dry = sync_to(&dest, &cfg, &SyncOptions::dry_run());
        assert!(dry.dry_run);
        assert_eq!(dest.content(), Some(entries(&[("a", "y"), ("old", "z")])));
        assert_eq!(*dest.writes.lock(), 0);

        let real = sync_to(&dest, &cfg, &SyncOptions::default());
        assert_eq!(dry.changes, real.changes);
        assert_eq!(*dest.writes.lock(), 1);
    }

    #[test]
    fn disabled_servers_are_not_written() {
        let mut cfg = config(&[("a", "x"), ("off", "y")]);
        if let Some(server) = cfg.servers.get_mut(&ServerName::from("off")) {
            server.enabled = false;
        }
        let dest = MemoryDestination::new("d");
        sync_to(&dest, &cfg, &SyncOptions::default());
        assert_eq!(dest.content(), Some(entries(&[("a", "x")])));
    }

    #[test]
    fn transform_failure_is_fatal_and_writes_nothing() {
        let dest = MemoryDestination {
            fail_transform: true,
            ..MemoryDestination::new("d")
        };
        let result = sync_to(&dest, &config(&[("a", "x")]), &SyncOptions::default());
        assert!(!result.success);
        assert!(result.fatal_error().unwrap().starts_with("transform"));
        assert_eq!(*dest.writes.lock(), 0);
    }

    #[test]
    fn backup_failure_is_recoverable() {
        let dest = MemoryDestination {
            fail_backup: true,
            ..MemoryDestination::new("d")
        }
        .with_content(entries(&[("a", "y")]));
        let options = SyncOptions {
            dry_run: false,
            backup: true,
        };
        let result = sync_to(&dest, &config(&[("a", "x")]), &options);
        assert!(result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].recoverable);
        assert_eq!(dest.content(), Some(entries(&[("a", "x")])));
    }

    #[test]
    fn backup_skipped_without_existing_content_or_on_dry_run() {
        let options = SyncOptions {
            dry_run: false,
            backup: true,
        };
        let fresh = MemoryDestination::new("fresh");
        let result = sync_to(&fresh, &config(&[("a", "x")]), &options);
        assert!(result.backup_path.is_none());
        assert_eq!(*fresh.backups.lock(), 0);

        let existing = MemoryDestination::new("existing").with_content(entries(&[("a", "y")]));
        let dry = SyncOptions {
            dry_run: true,
            backup: true,
        };
        sync_to(&existing, &config(&[("a", "x")]), &dry);
        assert_eq!(*existing.backups.lock(), 0);

        let result = sync_to(&existing, &config(&[("a", "x")]), &options);
        assert_eq!(*existing.backups.lock(), 1);
        assert!(result.backup_path.is_some());
    }

    #[test]
    fn write_failure_is_fatal() {
        let dest = MemoryDestination {
            fail_write: true,
            ..MemoryDestination::new("d")
        };
        let result = sync_to(&dest, &config(&[("a", "x")]), &SyncOptions::default());
        assert!(!result.success);
        assert!(result.fatal_error().unwrap().starts_with("write"));
    }

    #[test]
    fn preview_renders_a_unified_diff() {
        let dest = MemoryDestination::new("editor").with_content(entries(&[("a", "y")]));
        let (result, diff) = preview(&dest, &config(&[("a", "x")]));
        assert!(result.dry_run);
        assert!(diff.contains("-    \"command\": \"y\""), "diff was:\n{diff}");
        assert!(diff.contains("+    \"command\": \"x\""), "diff was:\n{diff}");
        assert_eq!(dest.content(), Some(entries(&[("a", "y")])));
    }
}
