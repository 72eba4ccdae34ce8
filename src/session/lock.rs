//! Host-local, crash-safe exclusive lock per session.
//!
//! Ownership is decided by OS process liveness of the recorded pid, never by
//! age. The lock record is written to a private temp file and published with
//! a hard link, so creation is exclusive and readers never see a partial file.
//! Removals are serialized with `flock` on a sidecar file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

use super::SessionId;
use crate::process::{current_pid, hostname, is_process_alive};
use crate::{clog, clog_debug, clog_warn, Error, Result};

pub const LOCK_FILE: &str = "session.lock";

/// Publish/reclaim rounds before giving up under heavy contention.
const MAX_ACQUIRE_ATTEMPTS: usize = 5;

/// Contents of `session.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub session_id: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    fn for_current_process(session_id: &SessionId) -> Self {
        Self {
            session_id: session_id.to_string(),
            pid: current_pid(),
            hostname: hostname(),
            started_at: Utc::now(),
        }
    }

    /// Whether the owner still holds the lock. A record from another host
    /// cannot be probed here and counts as held.
    pub fn is_held(&self) -> bool {
        if self.hostname != hostname() {
            return true;
        }
        is_process_alive(self.pid)
    }

    fn is_ours(&self) -> bool {
        self.pid == current_pid() && self.hostname == hostname()
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    sessions_dir: PathBuf,
}

impl LockManager {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn lock_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir.join(session_id.as_str()).join(LOCK_FILE)
    }

    /// Take the session lock, reclaiming it from a dead owner if needed.
    ///
    /// # Errors
    /// `AlreadyLocked` with the holder's identity when a live process owns it.
    pub fn acquire(&self, session_id: &SessionId) -> Result<SessionLock> {
        let path = self.lock_path(session_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let info = LockInfo::for_current_process(session_id);
        clog_debug!("LockManager::acquire session={} pid={}", session_id, info.pid);

        let contents = lock_bytes(&info)?;
        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            if publish_exclusive(&path, &contents)? {
                clog!("Lock acquired: session={} pid={}", session_id, info.pid);
                return Ok(SessionLock {
                    path,
                    session_id: session_id.clone(),
                    info,
                    released: false,
                });
            }

            let Some(raw) = read_lock_bytes(&path)? else {
                clog_debug!("Lock vanished before read (attempt {}), retrying", attempt);
                continue;
            };
            match parse_lock(&path, &raw) {
                Ok(existing) if existing.is_held() => {
                    return Err(Error::AlreadyLocked {
                        session_id: session_id.to_string(),
                        holder: existing,
                    });
                }
                Ok(stale) => {
                    clog_warn!(
                        "Reclaiming stale lock: session={} dead_pid={} host={}",
                        session_id,
                        stale.pid,
                        stale.hostname
                    );
                    remove_if_unchanged(&path, &raw)?;
                }
                Err(e) => {
                    clog_warn!("Unreadable lock for session {}: {}; removing", session_id, e);
                    remove_if_unchanged(&path, &raw)?;
                }
            }
        }

        match read_lock_file(&path) {
            Ok(Some(holder)) => Err(Error::AlreadyLocked {
                session_id: session_id.to_string(),
                holder,
            }),
            _ => Err(Error::Process(format!(
                "Could not acquire lock for session {} after {} attempts",
                session_id, MAX_ACQUIRE_ATTEMPTS
            ))),
        }
    }

    /// Raw lock record, live or not.
    pub fn read(&self, session_id: &SessionId) -> Result<Option<LockInfo>> {
        read_lock_file(&self.lock_path(session_id))
    }

    /// The live holder, if any. Stale and unreadable records report unlocked.
    pub fn is_locked(&self, session_id: &SessionId) -> Result<Option<LockInfo>> {
        match read_lock_file(&self.lock_path(session_id)) {
            Ok(Some(info)) if info.is_held() => Ok(Some(info)),
            Ok(_) => Ok(None),
            Err(Error::SessionCorrupted { reason, .. }) => {
                clog_warn!("is_locked: unreadable lock for {}: {}", session_id, reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the lock file regardless of owner. Returns whether a file existed.
    pub fn force_release(&self, session_id: &SessionId) -> Result<bool> {
        let path = self.lock_path(session_id);
        let _guard = removal_guard(&path)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                clog!("Lock force-released: session={}", session_id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the lock only if its owner is dead or the record is unreadable.
    /// A record replaced after it was read is left in place.
    ///
    /// # Errors
    /// `AlreadyLocked` when a live process owns the lock.
    pub fn reclaim_stale(&self, session_id: &SessionId) -> Result<Reclaim> {
        let path = self.lock_path(session_id);
        let Some(raw) = read_lock_bytes(&path)? else {
            return Ok(Reclaim::Absent);
        };
        let previous = match parse_lock(&path, &raw) {
            Ok(info) if info.is_held() => {
                return Err(Error::AlreadyLocked {
                    session_id: session_id.to_string(),
                    holder: info,
                });
            }
            Ok(info) => Some(info),
            Err(_) => None,
        };
        if remove_if_unchanged(&path, &raw)? {
            clog!("Stale lock reclaimed: session={}", session_id);
            Ok(Reclaim::Removed(previous))
        } else {
            clog_debug!("Lock for {} changed while reclaiming; left in place", session_id);
            Ok(Reclaim::Changed)
        }
    }
}

/// Outcome of [`LockManager::reclaim_stale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaim {
    Absent,
    /// The dead owner's record, or `None` when the file was unreadable.
    Removed(Option<LockInfo>),
    /// Another process replaced the record between the read and the removal.
    Changed,
}

/// Handle to a held session lock. Released on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    session_id: SessionId,
    info: LockInfo,
    released: bool,
}

impl SessionLock {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove the lock file if it still holds this lock's record. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if remove_if_unchanged(&self.path, &lock_bytes(&self.info)?)? {
            clog!("Lock released: session={}", self.session_id);
            return Ok(());
        }
        match read_lock_file(&self.path) {
            Ok(Some(current)) => {
                clog_warn!(
                    "Not releasing lock for {}: now held by pid {} on {}",
                    self.session_id,
                    current.pid,
                    current.hostname
                );
            }
            Ok(None) => {
                clog_debug!("Lock for {} already gone", self.session_id);
            }
            Err(e) => {
                clog_warn!("Not releasing unreadable lock for {}: {}", self.session_id, e);
            }
        }
        Ok(())
    }

    /// Touch the lock file's mtime. Advisory only; liveness stays pid-based.
    pub fn refresh(&self) -> Result<()> {
        if self.released {
            return Err(Error::LockNotHeld(self.session_id.to_string()));
        }
        match read_lock_file(&self.path)? {
            Some(current) if current.is_ours() => {
                let file = fs::File::options().write(true).open(&self.path)?;
                file.set_modified(SystemTime::now())?;
                Ok(())
            }
            _ => Err(Error::LockNotHeld(self.session_id.to_string())),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                clog_warn!("Failed to release lock on drop for {}: {}", self.session_id, e);
            }
        }
    }
}

/// Short-lived exclusive lock around a read-compare-write of one file.
/// Removed on drop. A lock left by a dead process is reclaimed.
pub(crate) struct WriteGuard {
    path: PathBuf,
    contents: Vec<u8>,
}

/// Attempts before a busy write lock is reported. Holders keep it for one
/// small write, so this is generous.
const WRITE_LOCK_ATTEMPTS: usize = 500;
const WRITE_LOCK_BACKOFF: Duration = Duration::from_millis(2);

impl WriteGuard {
    pub(crate) fn acquire(path: &Path, session_id: &SessionId) -> Result<Self> {
        let contents = lock_bytes(&LockInfo::for_current_process(session_id))?;
        let mut holder = None;
        for _ in 0..WRITE_LOCK_ATTEMPTS {
            if publish_exclusive(path, &contents)? {
                return Ok(Self {
                    path: path.to_path_buf(),
                    contents,
                });
            }
            let Some(raw) = read_lock_bytes(path)? else {
                continue;
            };
            match parse_lock(path, &raw) {
                Ok(info) if info.is_held() => {
                    holder = Some(info);
                    thread::sleep(WRITE_LOCK_BACKOFF);
                }
                Ok(_) | Err(_) => {
                    clog_warn!("Reclaiming abandoned write lock {}", path.display());
                    remove_if_unchanged(path, &raw)?;
                }
            }
        }
        match holder {
            Some(holder) => Err(Error::AlreadyLocked {
                session_id: session_id.to_string(),
                holder,
            }),
            None => Err(Error::Process(format!(
                "Could not take write lock {}",
                path.display()
            ))),
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_if_unchanged(&self.path, &self.contents) {
            clog_warn!("Failed to drop write lock {}: {}", self.path.display(), e);
        }
    }
}

fn lock_bytes(info: &LockInfo) -> Result<Vec<u8>> {
    let mut contents = serde_json::to_vec_pretty(info)?;
    contents.push(b'\n');
    Ok(contents)
}

/// Write `contents` to a temp file beside `path`, then hard-link it into
/// place. Returns false when `path` already exists.
fn publish_exclusive(path: &Path, contents: &[u8]) -> Result<bool> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("Lock path has no parent: {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    match fs::hard_link(tmp.path(), path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_lock_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(c) => Ok(Some(c)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_lock(path: &Path, raw: &[u8]) -> Result<LockInfo> {
    serde_json::from_slice(raw).map_err(|e| Error::SessionCorrupted {
        id: session_id_from_lock_path(path),
        reason: format!("lock file: {}", e),
    })
}

fn read_lock_file(path: &Path) -> Result<Option<LockInfo>> {
    match read_lock_bytes(path)? {
        Some(raw) => parse_lock(path, &raw).map(Some),
        None => Ok(None),
    }
}

fn session_id_from_lock_path(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Delete the lock at `path` only if it still holds exactly `expected`.
/// Returns whether it was removed.
///
/// Every removal of a lock file goes through [`removal_guard`]. A lock path
/// only takes new contents after a removal, so the compare and the delete
/// below cannot be split by a competing reclaim.
pub(crate) fn remove_if_unchanged(path: &Path, expected: &[u8]) -> Result<bool> {
    let _guard = removal_guard(path)?;
    match read_lock_bytes(path)? {
        Some(current) if current == expected => {}
        _ => return Ok(false),
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn mutex_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!(".{}.mutex", file_name))
}

/// Exclusive `flock` on a sidecar of `path`, held until dropped. `None`
/// when the directory is gone, as there is nothing left to remove.
#[cfg(unix)]
fn removal_guard(path: &Path) -> Result<Option<Flock<fs::File>>> {
    let file = match fs::File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(mutex_path(path))
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Flock::lock(file, FlockArg::LockExclusive)
        .map(Some)
        .map_err(|(_, errno)| Error::Process(format!("flock {}: {}", path.display(), errno)))
}

#[cfg(not(unix))]
fn removal_guard(_path: &Path) -> Result<Option<()>> {
    Ok(Some(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn write_lock(manager: &LockManager, id: &SessionId, info: &LockInfo) {
        let path = manager.lock_path(id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_string(info).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();

        let mut lock = manager.acquire(&id).unwrap();
        let holder = manager.is_locked(&id).unwrap().unwrap();
        assert_eq!(holder.pid, current_pid());
        assert_eq!(holder.session_id, id.to_string());

        lock.release().unwrap();
        assert!(manager.is_locked(&id).unwrap().is_none());
        assert!(!manager.lock_path(&id).exists());

        // idempotent
        lock.release().unwrap();
        assert!(lock.is_released());
    }

    #[test]
    fn test_lock_file_shape() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let _lock = manager.acquire(&id).unwrap();

        let raw = fs::read_to_string(manager.lock_path(&id)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for key in ["session_id", "pid", "hostname", "started_at"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_second_acquire_reports_live_holder() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let _lock = manager.acquire(&id).unwrap();

        match manager.acquire(&id) {
            Err(Error::AlreadyLocked { holder, .. }) => {
                assert_eq!(holder.pid, current_pid());
                assert_eq!(holder.hostname, hostname());
            }
            other => panic!("expected AlreadyLocked, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let stale = LockInfo {
            session_id: id.to_string(),
            pid: dead_pid(),
            hostname: hostname(),
            started_at: Utc::now(),
        };
        write_lock(&manager, &id, &stale);

        assert!(manager.is_locked(&id).unwrap().is_none());
        let lock = manager.acquire(&id).unwrap();
        assert_eq!(lock.info().pid, current_pid());
        assert_eq!(manager.read(&id).unwrap().unwrap().pid, current_pid());
    }

    #[test]
    fn test_foreign_host_lock_counts_as_held() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let foreign = LockInfo {
            session_id: id.to_string(),
            pid: dead_pid(),
            hostname: format!("{}-elsewhere", hostname()),
            started_at: Utc::now(),
        };
        write_lock(&manager, &id, &foreign);

        assert!(matches!(
            manager.acquire(&id),
            Err(Error::AlreadyLocked { .. })
        ));
    }

    #[test]
    fn test_corrupt_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let path = manager.lock_path(&id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        assert!(manager.is_locked(&id).unwrap().is_none());
        assert!(manager.acquire(&id).is_ok());
    }

    #[test]
    fn test_release_does_not_remove_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let mut lock = manager.acquire(&id).unwrap();

        // Someone reclaimed the path after us.
        let newer = LockInfo {
            session_id: id.to_string(),
            pid: current_pid() + 1,
            hostname: hostname(),
            started_at: Utc::now(),
        };
        fs::write(manager.lock_path(&id), serde_json::to_string(&newer).unwrap()).unwrap();

        lock.release().unwrap();
        assert_eq!(manager.read(&id).unwrap(), Some(newer));
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        {
            let _lock = manager.acquire(&id).unwrap();
            assert!(manager.lock_path(&id).exists());
        }
        assert!(!manager.lock_path(&id).exists());
    }

    #[test]
    fn test_refresh_touches_mtime() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let mut lock = manager.acquire(&id).unwrap();

        let path = manager.lock_path(&id);
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        lock.refresh().unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(mtime > old);

        lock.release().unwrap();
        assert!(matches!(lock.refresh(), Err(Error::LockNotHeld(_))));
    }

    #[test]
    fn test_force_release() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let lock = manager.acquire(&id).unwrap();

        assert!(manager.force_release(&id).unwrap());
        assert!(!manager.force_release(&id).unwrap());
        assert!(manager.is_locked(&id).unwrap().is_none());
        drop(lock);
    }

    fn stale_info(id: &SessionId) -> LockInfo {
        LockInfo {
            session_id: id.to_string(),
            pid: dead_pid(),
            hostname: hostname(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_remove_if_unchanged_keeps_replaced_record() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        let stale = stale_info(&id);
        write_lock(&manager, &id, &stale);
        let path = manager.lock_path(&id);
        let seen = fs::read(&path).unwrap();

        // a competing process reclaims the stale lock after we read it
        let owner = manager.reclaim_stale(&id).unwrap();
        assert_eq!(owner, Reclaim::Removed(Some(stale)));
        let lock = manager.acquire(&id).unwrap();

        assert!(!remove_if_unchanged(&path, &seen).unwrap());
        assert_eq!(manager.read(&id).unwrap().as_ref(), Some(lock.info()));
    }

    #[test]
    fn test_reclaim_stale_outcomes() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let id = SessionId::new();
        assert_eq!(manager.reclaim_stale(&id).unwrap(), Reclaim::Absent);

        let path = manager.lock_path(&id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{garbage").unwrap();
        assert_eq!(manager.reclaim_stale(&id).unwrap(), Reclaim::Removed(None));
        assert!(!path.exists());

        let _lock = manager.acquire(&id).unwrap();
        assert!(matches!(
            manager.reclaim_stale(&id),
            Err(Error::AlreadyLocked { .. })
        ));
        assert!(path.exists());
    }

    #[test]
    fn test_competing_reclaimers_leave_one_owner() {
        use std::sync::{Arc, Barrier};

        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        for _ in 0..20 {
            let id = SessionId::new();
            write_lock(&manager, &id, &stale_info(&id));

            let barrier = Arc::new(Barrier::new(6));
            let handles: Vec<_> = (0..6)
                .map(|i| {
                    let manager = manager.clone();
                    let id = id.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 {
                            manager.acquire(&id).ok()
                        } else {
                            let _ = manager.reclaim_stale(&id);
                            None
                        }
                    })
                })
                .collect();
            let owners: Vec<SessionLock> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();

            assert!(owners.len() <= 1, "{} owners at once", owners.len());
            if let Some(owner) = owners.first() {
                assert_eq!(manager.read(&id).unwrap().as_ref(), Some(owner.info()));
            }
        }
    }

    #[test]
    fn test_write_guard_is_exclusive_and_reclaims_dead_holder() {
        let dir = TempDir::new().unwrap();
        let id = SessionId::new();
        let path = dir.path().join("progress.json.lock");

        let guard = WriteGuard::acquire(&path, &id).unwrap();
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());

        fs::write(&path, serde_json::to_string(&stale_info(&id)).unwrap()).unwrap();
        let guard = WriteGuard::acquire(&path, &id).unwrap();
        assert_eq!(read_lock_file(&path).unwrap().unwrap().pid, current_pid());
        drop(guard);
        assert!(!path.exists());
    }
}
