//! Per-server diffing and unified text previews.
//!
//! Entries are compared by their canonical JSON serialization: a server
//! only in the new content is an `add`, in both but serialized differently
//! an `update`, only in the old content a `remove`.

use std::collections::BTreeMap;

use similar::TextDiff;

use crate::destination::ServerEntries;
use crate::result::{Change, ChangeKind};

/// Entries plus their canonical serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    entries: ServerEntries,
    canonical: BTreeMap<String, String>,
}

impl Rendered {
    pub fn new(entries: ServerEntries) -> Result<Self, serde_json::Error> {
        let canonical = entries
            .iter()
            .map(|(name, value)| Ok((name.clone(), serde_json::to_string(value)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        Ok(Self { entries, canonical })
    }

    pub fn entries(&self) -> &ServerEntries {
        &self.entries
    }

    pub fn into_entries(self) -> ServerEntries {
        self.entries
    }
}

/// Diff `new` against `old`. With no old content every entry is an `add`.
pub fn compute_changes(old: Option<&Rendered>, new: &Rendered) -> Vec<Change> {
    let mut changes = Vec::new();

    for (name, serialized) in &new.canonical {
        let before = old.and_then(|o| o.canonical.get(name).map(|s| (s, &o.entries[name])));
        match before {
            None => changes.push(Change {
                kind: ChangeKind::Add,
                server: name.clone(),
                before: None,
                after: Some(new.entries[name].clone()),
            }),
            Some((old_serialized, old_value)) if old_serialized != serialized => {
                changes.push(Change {
                    kind: ChangeKind::Update,
                    server: name.clone(),
                    before: Some(old_value.clone()),
                    after: Some(new.entries[name].clone()),
                })
            }
            Some(_) => {}
        }
    }

    if let Some(old) = old {
        for (name, value) in &old.entries {
            if !new.canonical.contains_key(name) {
                changes.push(Change {
                    kind: ChangeKind::Remove,
                    server: name.clone(),
                    before: Some(value.clone()),
                    after: None,
                });
            }
        }
    }

    changes
}

/// Unified diff of the pretty-printed entries; empty when nothing differs.
pub fn unified(destination: &str, old: Option<&ServerEntries>, new: &ServerEntries) -> String {
    let empty = ServerEntries::new();
    let before = pretty(old.unwrap_or(&empty));
    let after = pretty(new);
    if before == after {
        return String::new();
    }
    let old_header = format!("a/{destination}");
    let new_header = format!("b/{destination}");
    TextDiff::from_lines(&before, &after)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string()
}

fn pretty(entries: &ServerEntries) -> String {
    let mut out = serde_json::to_string_pretty(entries).unwrap_or_default();
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rendered(pairs: &[(&str, serde_json::Value)]) -> Rendered {
        let entries = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Rendered::new(entries).expect("render")
    }

    #[test]
    fn no_old_content_means_every_entry_is_an_add() {
        let new = rendered(&[("a", json!({"command": "x"})), ("b", json!({"url": "u"}))]);
        let changes = compute_changes(None, &new);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Add));
    }

    #[test]
    fn changed_command_is_a_single_update() {
        let old = rendered(&[("a", json!({"command": "y"}))]);
        let new = rendered(&[("a", json!({"command": "x"}))]);
        let changes = compute_changes(Some(&old), &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Update);
        assert_eq!(changes[0].server, "a");
        assert_eq!(changes[0].before, Some(json!({"command": "y"})));
        assert_eq!(changes[0].after, Some(json!({"command": "x"})));
    }

    #[test]
    fn entries_only_in_old_content_are_removes() {
        let old = rendered(&[("a", json!({"command": "x"})), ("gone", json!({"command": "z"}))]);
        let new = rendered(&[("a", json!({"command": "x"}))]);
        let changes = compute_changes(Some(&old), &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Remove);
        assert_eq!(changes[0].server, "gone");
    }

    #[test]
    fn key_order_does_not_create_updates() {
        let old = rendered(&[("a", json!({"command": "x", "args": ["1"]}))]);
        let new = rendered(&[("a", json!({"args": ["1"], "command": "x"}))]);
        assert!(compute_changes(Some(&old), &new).is_empty());
    }

    #[test]
    fn unified_preview_has_headers_and_hunks() {
        let old: ServerEntries = [("a".to_string(), json!({"command": "y"}))].into();
        let new: ServerEntries = [("a".to_string(), json!({"command": "x"}))].into();
        let diff = unified("editor", Some(&old), &new);
        assert!(diff.contains("--- a/editor"));
        assert!(diff.contains("+++ b/editor"));
        assert!(diff.contains("@@"));
        assert!(unified("editor", Some(&new), &new).is_empty());
    }
}
