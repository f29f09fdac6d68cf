use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Contents of the lock file, for humans and for staleness checks.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held single-flight lock. The lock file is removed when this is dropped,
/// on every exit path, as long as it is still ours.
#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
    contents: String,
}

impl SyncLock {
    /// Try once to take the lock at `path`. Returns `Ok(None)` if a live lock
    /// is held by someone else. A lock whose holder process is gone, or that is
    /// older than `stale_after`, is reclaimed.
    pub fn try_acquire(path: &Path, stale_after: Duration) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match Self::create(path) {
            Ok(lock) => return Ok(Some(lock)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let observed = match fs::read_to_string(path) {
            Ok(text) => text,
            // Released between our create and read.
            Err(e) if e.kind() == ErrorKind::NotFound => return Self::create_or_skip(path),
            Err(e) => return Err(e),
        };

        match abandoned(path, &observed, stale_after) {
            Some(reason) => {
                tracing::warn!("Reclaiming sync lock {} ({})", path.display(), reason);
                Self::reclaim(path, &observed)
            }
            None => Ok(None),
        }
    }

    /// Move the abandoned lock aside under a unique name and take a new one.
    /// Only one reclaimer can win the rename; a loser that moved a fresh lock
    /// by mistake puts it back and skips.
    fn reclaim(path: &Path, observed: &str) -> std::io::Result<Option<Self>> {
        let tombstone = sibling(path, &format!("{}.reclaim", Uuid::new_v4()));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Self::create_or_skip(path),
            Err(e) => return Err(e),
        }

        let moved = fs::read_to_string(&tombstone).unwrap_or_default();
        if moved != observed {
            // hard_link never clobbers a lock created in the meantime.
            if let Err(e) = fs::hard_link(&tombstone, path) {
                tracing::error!(
                    "Failed to put back sync lock {} taken by another run: {}",
                    path.display(),
                    e
                );
            }
            remove_quietly(&tombstone);
            return Ok(None);
        }

        remove_quietly(&tombstone);
        Self::create_or_skip(path)
    }

    fn create_or_skip(path: &Path) -> std::io::Result<Option<Self>> {
        match Self::create(path) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let contents = serde_json::to_string(&info).unwrap_or_default();
        // The file existing is what matters; its contents are informational.
        let _ = file.write_all(contents.as_bytes());
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(text) if text == self.contents => {
                if let Err(e) = fs::remove_file(&self.path) {
                    if e.kind() != ErrorKind::NotFound {
                        tracing::error!(
                            "Failed to release sync lock {}: {}",
                            self.path.display(),
                            e
                        );
                    }
                }
            }
            Ok(_) => tracing::warn!(
                "Sync lock {} was taken over by another run, leaving it",
                self.path.display()
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::error!("Failed to read sync lock {}: {}", self.path.display(), e),
        }
    }
}

/// Why the lock described by `observed` may be taken over, if it may.
fn abandoned(path: &Path, observed: &str, stale_after: Duration) -> Option<String> {
    let info = serde_json::from_str::<LockInfo>(observed).ok();
    if let Some(info) = &info {
        if !process_alive(info.pid) {
            return Some(format!("holder pid {} is gone", info.pid));
        }
    }

    let since = match info {
        Some(info) => SystemTime::from(info.acquired_at),
        None => fs::metadata(path).and_then(|m| m.modified()).ok()?,
    };
    let age = SystemTime::now().duration_since(since).unwrap_or_default();
    (age > stale_after).then(|| format!("held for {age:?}"))
}

/// Signal 0 only checks existence; EPERM still means the process is there.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)),
        _ => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(1800);

    fn write_info(path: &Path, pid: u32, acquired_at: DateTime<Utc>) -> String {
        let text = serde_json::to_string(&LockInfo { pid, acquired_at }).unwrap();
        fs::write(path, &text).unwrap();
        text
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        let first = SyncLock::try_acquire(&path, STALE).unwrap();
        assert!(first.is_some());
        assert!(SyncLock::try_acquire(&path, STALE).unwrap().is_none());
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        drop(SyncLock::try_acquire(&path, STALE).unwrap());
        assert!(!path.exists());
        assert!(SyncLock::try_acquire(&path, STALE).unwrap().is_some());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");
        write_info(&path, std::process::id(), Utc::now() - chrono::Duration::hours(3));

        let lock = SyncLock::try_acquire(&path, STALE).unwrap();
        assert!(lock.is_some());
        let info: LockInfo = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert!(Utc::now() - info.acquired_at < chrono::Duration::minutes(1));
        assert_eq!(leftovers(dir.path()), ["sync.lock"]);
    }

    #[cfg(unix)]
    #[test]
    fn lock_of_dead_process_is_reclaimed_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");
        // Above any kernel pid_max, so never a running process.
        write_info(&path, i32::MAX as u32, Utc::now());

        assert!(SyncLock::try_acquire(&path, STALE).unwrap().is_some());
    }

    #[test]
    fn fresh_lock_of_live_process_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");
        let held = write_info(&path, std::process::id(), Utc::now());

        assert!(SyncLock::try_acquire(&path, STALE).unwrap().is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), held);
    }

    #[test]
    fn fresh_foreign_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");
        fs::write(&path, "garbage").unwrap();

        assert!(SyncLock::try_acquire(&path, STALE).unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn losing_reclaimer_leaves_the_winner_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");
        // What the loser saw before the winner replaced it.
        let stale = serde_json::to_string(&LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now() - chrono::Duration::hours(3),
        })
        .unwrap();
        let winner = write_info(&path, std::process::id(), Utc::now());

        assert!(SyncLock::reclaim(&path, &stale).unwrap().is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), winner);
        assert_eq!(leftovers(dir.path()), ["sync.lock"]);
    }

    #[test]
    fn drop_leaves_a_lock_it_no_longer_owns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.lock");

        let lock = SyncLock::try_acquire(&path, STALE).unwrap().unwrap();
        let other = write_info(&path, std::process::id(), Utc::now() + chrono::Duration::seconds(1));
        drop(lock);

        assert_eq!(fs::read_to_string(&path).unwrap(), other);
    }

    #[test]
    fn creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/locks/sync.lock");
        assert!(SyncLock::try_acquire(&path, STALE).unwrap().is_some());
    }
}
