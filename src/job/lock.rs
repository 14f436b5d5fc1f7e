//! Cross-process job locks
//!
//! A lock is a file `<script>-<session>.lock` holding `{pid, timestamp}`. A lock older
//! than its trigger's staleness threshold is considered abandoned and replaced.

use crate::error::LockError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, warn};

/// What launched the job; decides when its lock goes stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Interactive, web-triggered
    Web,
    /// Cron or CLI
    Scheduled,
}

impl Trigger {
    pub fn stale_after(&self) -> Duration {
        match self {
            Trigger::Web => Duration::from_secs(2 * 60),
            Trigger::Scheduled => Duration::from_secs(60 * 60),
        }
    }
}

/// Lock identity: script namespace plus user/session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKey {
    pub script: String,
    pub session: String,
    pub trigger: Trigger,
}

impl JobKey {
    pub fn new(script: &str, session: &str, trigger: Trigger) -> Self {
        Self {
            script: script.to_string(),
            session: session.to_string(),
            trigger,
        }
    }

    fn file_name(&self) -> String {
        format!("{}-{}.lock", sanitize(&self.script), sanitize(&self.session))
    }
}

/// `-` separates namespace from session, so it never survives inside either
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn namespace_prefix(namespace: &str) -> String {
    format!("{}-", sanitize(namespace))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LockContents {
    pid: u32,
    /// Epoch milliseconds
    timestamp: i64,
}

impl LockContents {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.timestamp;
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

/// Single-writer-per-key mutual exclusion
pub trait JobLock: Send + Sync {
    /// Take the lock, replacing a stale holder; `Busy` if a live holder exists
    fn try_acquire(&self, key: &JobKey) -> Result<(), LockError>;

    fn release(&self, key: &JobKey);

    /// Locks currently held under `namespace`, regardless of session
    fn active_count(&self, namespace: &str) -> Result<usize, LockError>;
}

/// Releases its lock when dropped
pub struct JobLockGuard {
    lock: Arc<dyn JobLock>,
    key: JobKey,
}

impl JobLockGuard {
    pub fn key(&self) -> &JobKey {
        &self.key
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

impl std::fmt::Debug for JobLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLockGuard").field("key", &self.key).finish()
    }
}

/// Acquire `key`, then enforce the per-namespace cap (our own lock included)
pub fn acquire(lock: Arc<dyn JobLock>, key: JobKey, cap: usize) -> Result<JobLockGuard, LockError> {
    lock.try_acquire(&key)?;
    let guard = JobLockGuard { lock, key };

    let count = guard.lock.active_count(&guard.key.script)?;
    if count > cap {
        return Err(LockError::CapExceeded {
            namespace: guard.key.script.clone(),
            count,
            cap,
        });
    }
    Ok(guard)
}

/// Lock files under a well-known directory
#[derive(Debug, Clone)]
pub struct FileJobLock {
    dir: PathBuf,
}

impl FileJobLock {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, key: &JobKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn read_existing(path: &Path) -> Result<Option<LockContents>, LockError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Ok(contents) = serde_json::from_str::<LockContents>(&raw) {
            return Ok(Some(contents));
        }

        // unreadable body: fall back to the file's mtime
        let modified = fs::metadata(path)?.modified()?;
        let timestamp = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Some(LockContents { pid: 0, timestamp }))
    }

    /// Remove the lock at `key` only if it still holds `seen`.
    ///
    /// The file is renamed aside first so a concurrent replacement is never deleted:
    /// if what we moved is not `seen`, it is linked back and `false` is returned.
    fn remove_if_unchanged(&self, key: &JobKey, seen: &LockContents) -> Result<bool, LockError> {
        let path = self.path(key);
        let aside = self
            .dir
            .join(format!("{}.{}.stale", key.file_name(), std::process::id()));

        match fs::rename(&path, &aside) {
            Ok(()) => {}
            // already gone; the exclusive create decides who wins
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        if Self::read_existing(&aside)?.as_ref() == Some(seen) {
            fs::remove_file(&aside)?;
            return Ok(true);
        }

        debug!(path = %path.display(), "lock was replaced while removing it, restoring");
        let restored = match fs::hard_link(&aside, &path) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = fs::remove_file(&aside) {
            warn!(path = %aside.display(), error = %e, "failed to remove set-aside lock");
        }
        restored
    }
}

impl JobLock for FileJobLock {
    fn try_acquire(&self, key: &JobKey) -> Result<(), LockError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(key);

        if let Some(existing) = Self::read_existing(&path)? {
            let age = existing.age();
            if age < key.trigger.stale_after() {
                return Err(LockError::Busy {
                    pid: existing.pid,
                    age,
                });
            }
            warn!(path = %path.display(), pid = existing.pid, ?age, "removing stale lock");
            if !self.remove_if_unchanged(key, &existing)? {
                return Err(LockError::Busy {
                    pid: 0,
                    age: Duration::ZERO,
                });
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            // another process won the race between our check and create
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(LockError::Busy {
                    pid: 0,
                    age: Duration::ZERO,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let contents = serde_json::to_string(&LockContents::current())
            .map_err(|e| LockError::Io(std::io::Error::new(ErrorKind::Other, e)))?;
        file.write_all(contents.as_bytes())?;
        debug!(path = %path.display(), "lock acquired");
        Ok(())
    }

    fn release(&self, key: &JobKey) {
        let path = self.path(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove lock");
            }
        }
    }

    fn active_count(&self, namespace: &str) -> Result<usize, LockError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let prefix = namespace_prefix(namespace);
        let mut count = 0;
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".lock") {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// In-process lock table for single-process runs and tests
#[derive(Debug, Default)]
pub struct MemoryJobLock {
    held: Mutex<HashMap<String, LockContents>>,
}

impl MemoryJobLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a holder that took the lock `age` ago
    pub fn insert_held(&self, key: &JobKey, pid: u32, age: Duration) {
        let contents = LockContents {
            pid,
            timestamp: Utc::now().timestamp_millis() - age.as_millis() as i64,
        };
        self.table().insert(key.file_name(), contents);
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockContents>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobLock for MemoryJobLock {
    fn try_acquire(&self, key: &JobKey) -> Result<(), LockError> {
        let mut table = self.table();
        if let Some(existing) = table.get(&key.file_name()) {
            let age = existing.age();
            if age < key.trigger.stale_after() {
                return Err(LockError::Busy {
                    pid: existing.pid,
                    age,
                });
            }
        }
        table.insert(key.file_name(), LockContents::current());
        Ok(())
    }

    fn release(&self, key: &JobKey) {
        self.table().remove(&key.file_name());
    }

    fn active_count(&self, namespace: &str) -> Result<usize, LockError> {
        let prefix = namespace_prefix(namespace);
        Ok(self.table().keys().filter(|k| k.starts_with(&prefix)).count())
    }
}
