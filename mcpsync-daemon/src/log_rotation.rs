//! Size-based log rotation for the daemon log file.
//!
//! Keeps at most `max_files` rotated copies using the scheme:
//!   daemon.log → daemon.log.1 → daemon.log.2 → … → daemon.log.N

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default size threshold (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated copies.
pub const MAX_ROTATED_FILES: usize = 5;

/// How often the background task checks the file size.
pub const ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_LOG_BYTES,
            max_files: MAX_ROTATED_FILES,
        }
    }
}

/// Rotate `log_path` if it has reached `policy.max_bytes`.
///
/// Rotation sequence (oldest first):
///   `<name>.<max_files>` deleted
///   `<name>.<n>` → `<name>.<n+1>` for n = max_files-1 … 1
///   `<name>` → `<name>.1`
///   Create fresh empty `<name>`.
///
/// Returns `true` if rotation occurred. A missing file is not an error.
pub fn rotate_if_needed(log_path: &Path, policy: &RotationPolicy) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if size < policy.max_bytes || policy.max_files == 0 {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, policy.max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for n in (1..policy.max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }

    fs::rename(log_path, numbered_path(log_path, 1))?;

    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;

    Ok(true)
}

/// Check `log_path` every `every` until shutdown. Errors are logged, never fatal.
pub(crate) async fn rotation_task(
    log_path: PathBuf,
    policy: RotationPolicy,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let path = log_path.clone();
                let outcome = tokio::task::spawn_blocking(move || rotate_if_needed(&path, &policy)).await;
                match outcome {
                    Ok(Ok(true)) => tracing::info!(path = %log_path.display(), "log file rotated"),
                    Ok(Ok(false)) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
                    }
                    Err(err) => tracing::warn!(error = %err, "log rotation task panicked"),
                }
            }
        }
    }
}

/// Path of the `n`-th rotated copy of `base` (e.g. `daemon.log.2`).
fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("daemon.log");
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL: RotationPolicy = RotationPolicy {
        max_bytes: 1024,
        max_files: 3,
    };

    fn oversized(path: &Path, fill: u8) {
        fs::write(path, vec![fill; SMALL.max_bytes as usize + 1]).unwrap();
    }

    #[test]
    fn rotation_noop_when_file_under_threshold() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        fs::write(&log, b"short").unwrap();
        assert!(!rotate_if_needed(&log, &SMALL).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn rotation_moves_content_aside_and_truncates() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        oversized(&log, b'x');

        assert!(rotate_if_needed(&log, &SMALL).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(
            fs::metadata(numbered_path(&log, 1)).unwrap().len(),
            SMALL.max_bytes + 1
        );
    }

    #[test]
    fn rotated_copies_are_capped_and_shifted() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");

        for round in 0..5u8 {
            oversized(&log, b'a' + round);
            rotate_if_needed(&log, &SMALL).unwrap();
        }

        for n in 1..=SMALL.max_files {
            assert!(numbered_path(&log, n).exists(), "missing .{n}");
        }
        assert!(!numbered_path(&log, SMALL.max_files + 1).exists());
        // Newest round ('e') sits in .1.
        assert_eq!(fs::read(numbered_path(&log, 1)).unwrap()[0], b'e');
    }

    #[test]
    fn missing_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("nonexistent.log");
        assert!(!rotate_if_needed(&log, &SMALL).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn task_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(rotation_task(
            dir.path().join("daemon.log"),
            SMALL,
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
