//! Lock Manager: a filesystem lease scoped to one (backend, directory) key.
//!
//! The lease file is created with `O_EXCL` and records the holder's pid and
//! acquisition time. A lease whose holder is dead, or which is older than the
//! TTL, is stale and gets reclaimed by the next [`LockManager::try_acquire`].
//! Reclaiming happens under an `fs2` advisory lock on a sidecar file so two
//! reclaimers cannot both remove a fresh lease.
//!
//! Acquisition never blocks. The lease is held only around the spawn
//! decision, never for a dispatch.

use crate::session::config::process_alive;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_stale(&self, ttl: Duration) -> bool {
        if !process_alive(self.pid) {
            return true;
        }
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }
}

/// Result of a non-blocking acquire
#[derive(Debug)]
pub enum Acquire {
    Held(LeaseGuard),
    Denied { holder: LeaseRecord },
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    ttl: Duration,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_acquire(&self) -> std::io::Result<Acquire> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        match self.create() {
            Ok(guard) => return Ok(Acquire::Held(guard)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        match self.reclaim_stale()? {
            Reclaim::Removed => match self.create() {
                Ok(guard) => Ok(Acquire::Held(guard)),
                // Someone else won the race after the removal
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(Acquire::Denied {
                    holder: self.read().unwrap_or_else(unknown_holder),
                }),
                Err(e) => Err(e),
            },
            Reclaim::Live(holder) => Ok(Acquire::Denied { holder }),
        }
    }

    /// Remove the lease if `guard`'s process still owns it
    pub fn release(&self, guard: LeaseGuard) -> std::io::Result<()> {
        guard.release()
    }

    /// Current holder, if the lease file is readable
    pub fn read(&self) -> Option<LeaseRecord> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn create(&self) -> std::io::Result<LeaseGuard> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let record = LeaseRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&record).map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        if let Err(e) = file.write_all(&body).and_then(|_| file.sync_all()) {
            let _ = std::fs::remove_file(&self.path);
            return Err(e);
        }
        tracing::debug!(path = %self.path.display(), pid = record.pid, "lease acquired");
        Ok(LeaseGuard {
            path: self.path.clone(),
            record,
            released: false,
        })
    }

    fn reclaim_stale(&self) -> std::io::Result<Reclaim> {
        let guard_path = self.path.with_extension("lock.guard");
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&guard_path)?;
        guard.lock_exclusive()?;

        let outcome = (|| {
            let record = self.read();
            let stale = match &record {
                Some(record) => record.is_stale(self.ttl),
                // Half-written or garbage: only stale once it is old enough
                None => self.file_age().map(|age| age > self.ttl).unwrap_or(true),
            };
            if !stale {
                return Ok(Reclaim::Live(record.unwrap_or_else(unknown_holder)));
            }
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            tracing::info!(
                path = %self.path.display(),
                holder = record.as_ref().map(|r| r.pid),
                "reclaimed stale lease"
            );
            Ok(Reclaim::Removed)
        })();

        let _ = FileExt::unlock(&guard);
        outcome
    }

    fn file_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }
}

enum Reclaim {
    Removed,
    Live(LeaseRecord),
}

fn unknown_holder() -> LeaseRecord {
    LeaseRecord {
        pid: 0,
        acquired_at: Utc::now(),
    }
}

/// A held lease; released on drop
#[derive(Debug)]
pub struct LeaseGuard {
    path: PathBuf,
    record: LeaseRecord,
    released: bool,
}

impl LeaseGuard {
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    pub fn release(mut self) -> std::io::Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> std::io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let current: Option<LeaseRecord> = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        if current.as_ref() != Some(&self.record) {
            // Reclaimed by someone else; the file is theirs now
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(dir.path().join("spawn.lock"), Duration::from_secs(30))
    }

    fn write_record(path: &Path, record: &LeaseRecord) {
        std::fs::write(path, serde_json::to_vec(record).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_then_deny_then_release() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);

        let guard = match lock.try_acquire().unwrap() {
            Acquire::Held(guard) => guard,
            other => panic!("expected lease, got {:?}", other),
        };
        assert_eq!(guard.record().pid, std::process::id());

        match lock.try_acquire().unwrap() {
            Acquire::Denied { holder } => assert_eq!(holder.pid, std::process::id()),
            other => panic!("expected denial, got {:?}", other),
        }

        lock.release(guard).unwrap();
        assert!(!lock.path().exists());
        assert!(matches!(lock.try_acquire().unwrap(), Acquire::Held(_)));
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);
        {
            let _guard = lock.try_acquire().unwrap();
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = LockManager::new(dir.path().join("spawn.lock"), Duration::from_secs(1));
        write_record(
            lock.path(),
            &LeaseRecord {
                pid: std::process::id(),
                acquired_at: Utc::now() - chrono::Duration::seconds(60),
            },
        );
        assert!(matches!(lock.try_acquire().unwrap(), Acquire::Held(_)));
    }

    #[test]
    fn test_fresh_garbage_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);
        std::fs::write(lock.path(), "{half").unwrap();
        assert!(matches!(lock.try_acquire().unwrap(), Acquire::Denied { .. }));
    }

    #[test]
    fn test_release_leaves_foreign_lease_alone() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);
        let guard = match lock.try_acquire().unwrap() {
            Acquire::Held(guard) => guard,
            other => panic!("expected lease, got {:?}", other),
        };

        let foreign = LeaseRecord {
            pid: 1,
            acquired_at: Utc::now(),
        };
        write_record(lock.path(), &foreign);
        guard.release().unwrap();
        assert_eq!(lock.read(), Some(foreign));
    }
}
