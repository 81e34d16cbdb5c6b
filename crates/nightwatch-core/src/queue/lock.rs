//! Advisory lock over the queue directory, shared across processes.
//!
//! The lock is a sentinel file created with `create_new`. Its body is a
//! per-acquisition token and its mtime is the age: a marker older than the
//! timeout is considered abandoned and may be taken over by the next caller.
//!
//! Takeover and a guard's release both move the marker aside with an atomic
//! `rename` before deciding what to do with it. Only the caller whose rename
//! succeeded looks at that marker, and a marker that turns out to be live (or
//! someone else's) is linked back into place untouched.

use crate::error::Result;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Marker body written by one acquisition. Releasing requires it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn new() -> Self {
        let held_since = crate::queue::store::format_timestamp(chrono::Utc::now());
        Self(format!(
            "pid={} heldSince={held_since} token={}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct QueueLock {
    path: PathBuf,
    timeout: Duration,
}

impl QueueLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Try once to take the lock. `None` means a live holder exists.
    pub fn acquire(&self) -> Result<Option<LockToken>> {
        if let Some(token) = self.try_create()? {
            return Ok(Some(token));
        }
        match age_of(&self.path)? {
            // Holder released between our create attempt and the stat.
            None => self.try_create(),
            Some(age) if age >= self.timeout => {
                if !self.claim_stale()? {
                    return Ok(None);
                }
                tracing::warn!(
                    path = %self.path.display(),
                    age_ms = age.as_millis() as u64,
                    "took over stale queue lock"
                );
                self.try_create()
            }
            Some(_) => Ok(None),
        }
    }

    /// Retry [`acquire`](Self::acquire) until it succeeds or `wait` elapses.
    pub fn acquire_with_wait(&self, wait: Duration) -> Result<Option<LockToken>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(token) = self.acquire()? {
                return Ok(Some(token));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Remove the marker whoever holds it. Idempotent.
    pub fn release(&self) -> Result<()> {
        remove_if_present(&self.path)
    }

    /// Remove the marker if it still carries `token`.
    ///
    /// Returns `false` when the marker is gone or belongs to someone who took
    /// it over; that marker is left in place.
    pub fn release_if_held(&self, token: &LockToken) -> Result<bool> {
        let Some(aside) = self.move_aside()? else {
            return Ok(false);
        };
        let body = std::fs::read_to_string(&aside).unwrap_or_default();
        if body.trim_end() == token.as_str() {
            remove_if_present(&aside)?;
            Ok(true)
        } else {
            self.restore(&aside)?;
            Ok(false)
        }
    }

    /// True only for a marker younger than the timeout.
    pub fn is_locked(&self) -> Result<bool> {
        Ok(matches!(age_of(&self.path)?, Some(age) if age < self.timeout))
    }

    fn try_create(&self) -> Result<Option<LockToken>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut f) => {
                let token = LockToken::new();
                writeln!(f, "{}", token.as_str())?;
                Ok(Some(token))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a marker we judged stale out of the way.
    ///
    /// Another caller may have replaced the stale marker with a fresh one
    /// since our stat, so the staleness is checked again on the moved file.
    /// Returns whether the path is now free for `try_create`.
    fn claim_stale(&self) -> Result<bool> {
        let Some(aside) = self.move_aside()? else {
            return Ok(true);
        };
        match age_of(&aside)? {
            Some(age) if age < self.timeout => {
                self.restore(&aside)?;
                Ok(false)
            }
            _ => {
                remove_if_present(&aside)?;
                Ok(true)
            }
        }
    }

    /// Atomically rename the marker to a unique sibling. `None` if absent.
    fn move_aside(&self) -> Result<Option<PathBuf>> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "queue.lock".to_string());
        let aside = self
            .path
            .with_file_name(format!("{name}.{}", uuid::Uuid::new_v4().simple()));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => Ok(Some(aside)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Put a marker moved by `move_aside` back, unless a new one appeared.
    fn restore(&self, aside: &Path) -> Result<()> {
        match std::fs::hard_link(aside, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(path = %self.path.display(), "queue lock replaced while moved aside");
            }
            Err(_) => {
                // No hard links on this filesystem.
                if !self.path.exists() {
                    std::fs::rename(aside, &self.path)?;
                    return Ok(());
                }
            }
        }
        remove_if_present(aside)
    }
}

/// Age of the marker at `path`, or `None` if there is no marker.
fn age_of(path: &Path) -> Result<Option<Duration>> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = meta.modified()?;
    // A clock step backwards makes the marker look fresh, never stale.
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(Some(age))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Holds a [`QueueLock`] for the lifetime of a critical section.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a QueueLock,
    token: LockToken,
}

impl<'a> LockGuard<'a> {
    /// Acquire `lock`, waiting up to `wait`. `None` means a live holder kept it.
    pub fn acquire(lock: &'a QueueLock, wait: Duration) -> Result<Option<Self>> {
        Ok(lock
            .acquire_with_wait(wait)?
            .map(|token| Self { lock, token }))
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.lock.release_if_held(&self.token) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(path = %self.lock.path.display(), "queue lock was taken over while held");
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %self.lock.path.display(), "failed to release queue lock");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
