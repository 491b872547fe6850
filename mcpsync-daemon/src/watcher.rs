//! Filesystem change notifications for one config source file.
//!
//! The containing directory is watched non-recursively so the file can be
//! replaced (atomic rename) or deleted and recreated without losing the
//! watch. Permission-only and access events are dropped, as is anything
//! matching an ignore glob.

use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::RegexSet;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::WatchError;

/// Patterns ignored on top of the caller's.
pub const DEFAULT_IGNORES: &[&str] = &["*.tmp", "*.swp", "*~", ".#*"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

pub struct ChangeWatcher {
    target: PathBuf,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    /// Start watching `path`. The parent directory is created if missing.
    pub fn watch(path: &Path, ignore: &[String]) -> Result<Self, WatchError> {
        let name = path
            .file_name()
            .ok_or_else(|| WatchError::NoFileName {
                path: path.to_path_buf(),
            })?
            .to_os_string();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|source| WatchError::Io {
            path: parent.clone(),
            source,
        })?;
        // Canonicalize so event paths (which arrive resolved, e.g.
        // /private/var/... on macOS) compare equal to the target.
        let dir = std::fs::canonicalize(&parent).unwrap_or(parent);
        let target = dir.join(name);

        let ignore = build_ignore_set(ignore)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let filter_target = target.clone();
        let mut watcher = recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "watcher event error");
                    return;
                }
            };
            for change in relevant_changes(&event, &filter_target, &ignore) {
                let _ = tx.send(change);
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %target.display(), "watching config source");

        Ok(Self {
            target,
            rx,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    /// Next change; `None` once the underlying watcher is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

fn build_ignore_set(extra: &[String]) -> Result<RegexSet, WatchError> {
    let patterns = DEFAULT_IGNORES
        .iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .map(glob_to_regex);
    Ok(RegexSet::new(patterns)?)
}

/// Anchored regex for a shell glob. `*` and `?` stay within one path
/// component, `**` crosses components, `[...]` (with `!` negation) is a
/// character class.
pub(crate) fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                // An unclosed class is left unclosed and fails to compile.
                for c in chars.by_ref() {
                    if c == '\\' {
                        out.push_str("\\\\");
                        continue;
                    }
                    out.push(c);
                    if c == ']' {
                        break;
                    }
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// Map a notify event kind onto a change kind; `None` for noise.
pub(crate) fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Rename),
        EventKind::Modify(_) | EventKind::Any => Some(ChangeKind::Modify),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

fn is_ignored(path: &Path, ignore: &RegexSet) -> bool {
    ignore.is_match(&path.to_string_lossy())
        || path
            .file_name()
            .map_or(false, |name| ignore.is_match(&name.to_string_lossy()))
}

/// Changes in `event` that touch `target` and survive the filters.
pub(crate) fn relevant_changes(event: &Event, target: &Path, ignore: &RegexSet) -> Vec<ChangeEvent> {
    let Some(kind) = classify(&event.kind) else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .filter(|path| path.as_path() == target && !is_ignored(path, ignore))
        .map(|path| ChangeEvent {
            kind,
            path: path.clone(),
        })
        .take(1)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn classify_drops_permission_and_access_noise() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))),
            None
        );
        assert_eq!(classify(&EventKind::Access(AccessKind::Any)), None);
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modify)
        );
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Create)
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Remove)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(ChangeKind::Rename)
        );
    }

    #[test]
    fn only_the_target_file_is_reported() {
        let ignore = build_ignore_set(&[]).unwrap();
        let target = Path::new("/cfg/servers.yaml");

        let rename = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/cfg/servers.yaml.tmp", "/cfg/servers.yaml"],
        );
        let changes = relevant_changes(&rename, target, &ignore);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Rename);

        let sibling = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            &["/cfg/daemon.sock"],
        );
        assert!(relevant_changes(&sibling, target, &ignore).is_empty());
    }

    #[test]
    fn caller_globs_are_applied() {
        let ignore = build_ignore_set(&["servers.*".to_string()]).unwrap();
        let ev = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            &["/cfg/servers.yaml"],
        );
        assert!(relevant_changes(&ev, Path::new("/cfg/servers.yaml"), &ignore).is_empty());
    }

    #[test]
    fn bad_glob_is_rejected() {
        assert!(matches!(
            build_ignore_set(&["a[".to_string()]),
            Err(WatchError::Pattern(_))
        ));
    }

    #[test]
    fn globs_translate_to_anchored_regexes() {
        let set = build_ignore_set(&["logs/**".to_string(), "backup-[!x]?.json".to_string()]).unwrap();
        assert!(set.is_match("servers.yaml.tmp"));
        assert!(set.is_match(".#servers.yaml"));
        assert!(set.is_match("logs/2024/daemon.log"));
        assert!(set.is_match("backup-a1.json"));
        assert!(!set.is_match("backup-x1.json"));
        assert!(!set.is_match("servers.yaml"));
        assert!(!set.is_match("dir/servers.tmp.yaml"));
        assert_eq!(glob_to_regex("a.b*"), r"^a\.b[^/]*$");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn surfaces_events_for_a_file_created_after_the_watch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("late/servers.yaml");
        let mut watcher = ChangeWatcher::watch(&path, &[]).unwrap();

        std::fs::write(&path, "servers: {}\n").unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("event within timeout")
            .expect("watcher open");
        assert_eq!(change.path, watcher.path());
    }
}
