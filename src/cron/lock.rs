//! File-based job locks
//!
//! One lock file per job name in the configured directory. The file name is the hex
//! SHA-256 of the job name; the content is `"<job>; <unix ts>; Date: <human date>"`.
//! Locks are advisory: whoever knows the job name can release it, which keeps manual
//! deletion of a lock file a valid operator action.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::Duration,
};

const RELEASE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    release_backoff: Duration,
}

impl LockManager {
    /// Lock manager rooted at `dir`; the directory is created on first acquire
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            release_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_release_backoff(mut self, backoff: Duration) -> Self {
        self.release_backoff = backoff;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<sha256 hex of job>.lock`
    pub fn lock_path(&self, job: &str) -> PathBuf {
        let digest = Sha256::digest(job.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.lock", name))
    }

    pub fn acquire_lock(&self, job: &str) -> bool {
        self.acquire_lock_at(job, Utc::now())
    }

    /// Take the lock, stamping it with `now`; never blocks
    pub fn acquire_lock_at(&self, job: &str, now: DateTime<Utc>) -> bool {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!("🔒 Lock directory {} unavailable: {}", self.dir.display(), e);
            return false;
        }
        match std::fs::metadata(&self.dir) {
            Ok(meta) if meta.permissions().readonly() => {
                tracing::warn!("🔒 Lock directory {} is read-only", self.dir.display());
                return false;
            }
            Err(e) => {
                tracing::warn!("🔒 Lock directory {} unavailable: {}", self.dir.display(), e);
                return false;
            }
            Ok(_) => {}
        }

        let path = self.lock_path(job);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!("🔒 Job {} is already locked", job);
                return false;
            }
            Err(e) => {
                tracing::warn!("🔒 Could not create lock for {}: {}", job, e);
                return false;
            }
        };

        let content = format!(
            "{}; {}; Date: {}",
            job,
            now.timestamp(),
            now.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Err(e) = file.write_all(content.as_bytes()).and_then(|_| file.sync_all()) {
            tracing::warn!("🔒 Could not write lock for {}: {}", job, e);
            drop(file);
            let _ = std::fs::remove_file(&path);
            return false;
        }

        tracing::debug!("🔐 Locked job {}", job);
        true
    }

    /// Delete the lock file, retrying with a growing pause
    pub async fn release_lock(&self, job: &str) -> bool {
        let path = self.lock_path(job);
        for attempt in 1..=RELEASE_ATTEMPTS {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "🔓 Releasing {} failed (attempt {}/{}): {}",
                    job,
                    attempt,
                    RELEASE_ATTEMPTS,
                    e
                ),
            }
            if self.check_if_unlocked(job) {
                tracing::debug!("🔓 Released job {}", job);
                return true;
            }
            tokio::time::sleep(self.release_backoff * attempt).await;
        }
        self.check_if_unlocked(job)
    }

    /// True when no lock file exists for `job`
    pub fn check_if_unlocked(&self, job: &str) -> bool {
        !self.lock_path(job).exists()
    }

    /// Acquisition time recorded in the lock; the file mtime when the content is unreadable
    pub fn locked_since(&self, job: &str) -> Option<DateTime<Utc>> {
        let path = self.lock_path(job);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(_) => String::new(),
        };

        content
            .split(';')
            .nth(1)
            .and_then(|ts| ts.trim().parse::<i64>().ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or_else(|| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some(DateTime::<Utc>::from(modified))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> LockManager {
        LockManager::new(dir.path().join("locks")).with_release_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(&dir);

        assert!(locks.check_if_unlocked("synchronizer"));
        assert!(locks.acquire_lock("synchronizer"));
        assert!(!locks.check_if_unlocked("synchronizer"));
        assert!(!locks.acquire_lock("synchronizer"));

        // Locks are per job name
        assert!(locks.acquire_lock("retrieval"));

        assert!(locks.release_lock("synchronizer").await);
        assert!(locks.check_if_unlocked("synchronizer"));
        assert!(!locks.check_if_unlocked("retrieval"));
    }

    #[tokio::test]
    async fn test_lock_file_format_and_locked_since() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(&dir);
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        assert!(locks.locked_since("logclear").is_none());
        assert!(locks.acquire_lock_at("logclear", at));

        let content = std::fs::read_to_string(locks.lock_path("logclear")).unwrap();
        assert!(content.starts_with("logclear; 1700000000; Date: 2023-11-14"));
        assert_eq!(locks.locked_since("logclear"), Some(at));
    }

    #[tokio::test]
    async fn test_unparsable_lock_falls_back_to_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(&dir);
        std::fs::create_dir_all(locks.dir()).unwrap();
        std::fs::write(locks.lock_path("retrieval"), "garbage").unwrap();

        assert!(locks.locked_since("retrieval").is_some());
        assert!(locks.release_lock("retrieval").await);
    }

    #[test]
    fn test_lock_path_is_stable_hash() {
        let locks = LockManager::new("/tmp/magelink-locks");
        let path = locks.lock_path("synchronizer");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + ".lock".len());
        assert_eq!(path, locks.lock_path("synchronizer"));
        assert_ne!(path, locks.lock_path("retrieval"));
    }
}
