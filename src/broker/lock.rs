//! Lock files guarding shared spool state.
//!
//! A lock is a file created exclusively next to the guarded path, holding the
//! owner's PID. Locks untouched for [`STALE_AFTER`] are taken over, so
//! long-lived holders call [`LockHandle::refresh`] more often than that.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

/// A lock older than this is considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

/// Wait between attempts in [`acquire_lock_wait`].
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Try once to take an exclusive lock next to `path`.
pub fn acquire_lock(path: &Path) -> Result<LockHandle> {
    try_acquire(path)?.ok_or_else(|| {
        Error::Transport(format!("Lock file is held: {}", lock_path_for(path).display()))
    })
}

/// Like [`acquire_lock`], but a live holder yields `Ok(None)` instead of an error.
pub fn try_acquire(path: &Path) -> Result<Option<LockHandle>> {
    let lock_path = lock_path_for(path);

    if let Ok(metadata) = lock_path.metadata() {
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();

        if age < STALE_AFTER {
            return Ok(None);
        }

        tracing::warn!("Removing stale lock: {}", lock_path.display());
        std::fs::remove_file(&lock_path).ok();
    }

    let mut lock_file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
        Ok(file) => file,
        // Lost the race to another taker.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => {
            return Err(Error::Transport(format!(
                "Failed to take lock {}: {}",
                lock_path.display(),
                e
            )))
        }
    };
    lock_file.write_all(owner_line().as_bytes())?;

    tracing::trace!("Acquired lock: {}", lock_path.display());
    Ok(Some(LockHandle { lock_path }))
}

/// Take the lock, retrying until `timeout` elapses. Blocks the calling thread.
pub fn acquire_lock_wait(path: &Path, timeout: Duration) -> Result<LockHandle> {
    let started = std::time::Instant::now();
    loop {
        match acquire_lock(path) {
            Ok(handle) => return Ok(handle),
            Err(e) if started.elapsed() >= timeout => return Err(e),
            Err(_) => std::thread::sleep(RETRY_DELAY),
        }
    }
}

/// Lock handle - releases lock when dropped.
#[derive(Debug)]
pub struct LockHandle {
    lock_path: PathBuf,
}

impl LockHandle {
    /// Rewrite the lock file so its age restarts at zero.
    pub fn refresh(&self) -> Result<()> {
        let mut lock_file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.lock_path)?;
        lock_file.write_all(owner_line().as_bytes())?;
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => tracing::trace!("Released lock: {}", self.lock_path.display()),
            // Removed along with its directory.
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to release lock {}: {}", self.lock_path.display(), e),
        }
    }
}

/// Acquire lock, execute function, release lock.
pub fn with_lock<T, F>(path: &Path, timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _lock = acquire_lock_wait(path, timeout)?;
    f()
}

fn owner_line() -> String {
    format!("{}\n", std::process::id())
}

fn lock_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("bindings.json");
        fs::write(&test_file, "{}").unwrap();

        let lock1 = acquire_lock(&test_file);
        assert!(lock1.is_ok());

        let lock2 = acquire_lock(&test_file);
        assert!(lock2.is_err());

        drop(lock1);

        let lock3 = acquire_lock(&test_file);
        assert!(lock3.is_ok());
    }

    #[test]
    fn test_wait_gives_up_after_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("bindings.json");

        let _held = acquire_lock(&test_file).unwrap();
        let err = acquire_lock_wait(&test_file, Duration::from_millis(30));
        assert!(matches!(err, Err(Error::Transport(_))));
    }

    #[test]
    fn test_try_acquire_reports_live_holder() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("consumer");

        let held = try_acquire(&test_file).unwrap().unwrap();
        assert!(try_acquire(&test_file).unwrap().is_none());

        held.refresh().unwrap();
        assert!(try_acquire(&test_file).unwrap().is_none());
        let owner = fs::read_to_string(temp_dir.path().join("consumer.lock")).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());

        drop(held);
        assert!(try_acquire(&test_file).unwrap().is_some());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("consumer");
        let lock_file = temp_dir.path().join("consumer.lock");
        fs::write(&lock_file, "1\n").unwrap();

        let old = SystemTime::now() - STALE_AFTER - Duration::from_secs(1);
        fs::File::options()
            .write(true)
            .open(&lock_file)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert!(try_acquire(&test_file).unwrap().is_some());
    }

    #[test]
    fn test_with_lock_releases() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("bindings.json");

        let value = with_lock(&test_file, Duration::from_millis(100), || Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert!(acquire_lock(&test_file).is_ok());
    }
}
