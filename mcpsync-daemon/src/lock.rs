//! Single-instance guard.
//!
//! The lock file holds the owner's pid and is protected by an OS advisory
//! exclusive lock (`flock` via `fs2`).
//! The OS lock is the source of truth: a leftover file whose lock can be
//! taken was left by a crashed owner and is reclaimed.
//!
//! Release unlinks the file, so a lock taken on a handle opened before that
//! unlink guards an orphaned inode. `acquire` checks that the inode it locked
//! is still the one at the path and starts over when it is not.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::LockError;

/// Exclusive ownership of "the daemon" for one home directory.
pub trait SingleInstanceLock: Send {
    /// Take ownership. Fails with [`LockError::AlreadyRunning`] while
    /// another live owner holds it.
    fn acquire(&mut self) -> Result<(), LockError>;

    /// Give ownership up. Releasing an unheld lock is a no-op.
    fn release(&mut self) -> Result<(), LockError>;

    fn is_held(&self) -> bool;

    fn describe(&self) -> String;
}

const MAX_LOCK_ATTEMPTS: u32 = 5;

pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, LockError> {
        // No truncate: the current owner's pid must stay readable.
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))
    }

    /// Lock an already opened handle. `Ok(None)` means the handle's inode was
    /// unlinked or replaced before the lock landed.
    fn lock_opened(&self, file: File) -> Result<Option<File>, LockError> {
        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(LockError::AlreadyRunning {
                    pid: Self::read_pid(&self.path),
                    path: self.path.clone(),
                });
            }
            return Err(io_err(&self.path, err));
        }

        let held = file.metadata().map_err(|e| io_err(&self.path, e))?;
        let linked = match fs::metadata(&self.path) {
            Ok(current) => current.dev() == held.dev() && current.ino() == held.ino(),
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(io_err(&self.path, err)),
        };
        if !linked {
            let _ = file.unlock();
            return Ok(None);
        }
        Ok(Some(file))
    }

    /// Pid recorded in the lock file at `path`, if readable.
    pub fn read_pid(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

fn io_err(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl SingleInstanceLock for FileLock {
    fn acquire(&mut self) -> Result<(), LockError> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let mut attempts = 0;
        let mut file = loop {
            if let Some(file) = self.lock_opened(self.open()?)? {
                break file;
            }
            attempts += 1;
            tracing::debug!(
                path = %self.path.display(),
                "lock file replaced while locking, retrying",
            );
            if attempts >= MAX_LOCK_ATTEMPTS {
                return Err(LockError::AlreadyRunning {
                    pid: Self::read_pid(&self.path),
                    path: self.path.clone(),
                });
            }
        };

        let mut previous = String::new();
        let _ = file.read_to_string(&mut previous);
        if let Ok(stale) = previous.trim().parse::<u32>() {
            tracing::warn!(
                path = %self.path.display(),
                stale_pid = stale,
                "reclaiming lock file left by a previous daemon",
            );
        }

        file.set_len(0).map_err(|e| io_err(&self.path, e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| io_err(&self.path, e))?;
        write!(file, "{}", std::process::id()).map_err(|e| io_err(&self.path, e))?;
        file.sync_all().map_err(|e| io_err(&self.path, e))?;

        tracing::debug!(path = %self.path.display(), "acquired daemon lock");
        self.file = Some(file);
        Ok(())
    }

    fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove while still locked so no other process sees an unlocked
        // file carrying our pid.
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&self.path, err)),
        };
        let _ = file.unlock();
        drop(file);
        tracing::debug!(path = %self.path.display(), "released daemon lock");
        removed
    }

    fn is_held(&self) -> bool {
        self.file.is_some()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_until_first_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/daemon.lock");

        let mut first = FileLock::new(&path);
        first.acquire().unwrap();
        assert!(first.is_held());
        assert_eq!(FileLock::read_pid(&path), Some(std::process::id()));

        let mut second = FileLock::new(&path);
        match second.acquire() {
            Err(LockError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert!(!second.is_held());

        first.release().unwrap();
        assert!(!path.exists());

        second.acquire().unwrap();
        assert!(second.is_held());
    }

    #[test]
    fn stale_file_without_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        fs::write(&path, "999999").unwrap();

        let mut lock = FileLock::new(&path);
        lock.acquire().unwrap();
        assert_eq!(FileLock::read_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        {
            let mut lock = FileLock::new(&path);
            lock.acquire().unwrap();
        }
        assert!(!path.exists());
        FileLock::new(&path).acquire().unwrap();
    }

    #[test]
    fn release_without_acquire_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut lock = FileLock::new(dir.path().join("daemon.lock"));
        lock.release().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn handle_opened_before_release_cannot_take_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");

        let mut first = FileLock::new(&path);
        first.acquire().unwrap();
        let early = FileLock::new(&path);
        let early_handle = early.open().unwrap();
        first.release().unwrap();

        let mut owner = FileLock::new(&path);
        owner.acquire().unwrap();

        assert!(early.lock_opened(early_handle).unwrap().is_none());
        assert!(owner.is_held());
        assert!(matches!(
            FileLock::new(&path).acquire(),
            Err(LockError::AlreadyRunning { .. })
        ));
    }
}
