//! Detects and repairs sessions left behind by crashed owners.
//!
//! Recovery only deals with lock and file state. Reconnecting to live
//! workers is left to the orchestrator on top.

use serde_json::Value;
use std::fs;
use std::io::ErrorKind;

use super::lock::{LockInfo, Reclaim};
use super::store::SessionStore;
use super::SessionId;
use crate::{clog, clog_debug, clog_warn, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryReason {
    /// The lock names a process that no longer exists.
    StaleLock { pid: u32, hostname: String },
    /// A dead lock with no session body next to it.
    OrphanedLock { pid: u32, hostname: String },
    /// The lock file exists but cannot be parsed.
    UnreadableLock { reason: String },
}

impl std::fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryReason::StaleLock { pid, hostname } => {
                write!(f, "stale lock (pid {} on {} is gone)", pid, hostname)
            }
            RecoveryReason::OrphanedLock { pid, hostname } => {
                write!(f, "orphaned lock (pid {} on {}, no session file)", pid, hostname)
            }
            RecoveryReason::UnreadableLock { reason } => write!(f, "unreadable lock: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCandidate {
    pub session_id: SessionId,
    pub name: Option<String>,
    pub reason: RecoveryReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    pub session_id: SessionId,
    pub lock_removed: bool,
    pub previous_holder: Option<LockInfo>,
}

pub struct RecoveryManager {
    store: SessionStore,
}

impl RecoveryManager {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Sessions whose lock is stale, orphaned or unreadable.
    pub fn check_for_recovery(&self) -> Result<Vec<RecoveryCandidate>> {
        let mut candidates = Vec::new();
        for id in self.store.list_ids()? {
            if let Some(reason) = self.diagnose(&id) {
                let name = self.store.load(&id).ok().map(|s| s.name);
                clog_debug!("Recovery candidate: session={} reason={}", id, reason);
                candidates.push(RecoveryCandidate {
                    session_id: id,
                    name,
                    reason,
                });
            }
        }
        Ok(candidates)
    }

    fn diagnose(&self, id: &SessionId) -> Option<RecoveryReason> {
        match self.store.locks().read(id) {
            Ok(Some(info)) if info.is_held() => None,
            Ok(Some(info)) if !self.store.exists(id) => Some(RecoveryReason::OrphanedLock {
                pid: info.pid,
                hostname: info.hostname,
            }),
            Ok(Some(info)) => Some(RecoveryReason::StaleLock {
                pid: info.pid,
                hostname: info.hostname,
            }),
            Ok(None) => None,
            Err(Error::SessionCorrupted { reason, .. }) => {
                Some(RecoveryReason::UnreadableLock { reason })
            }
            Err(e) => {
                clog_warn!("Could not read lock for session {}: {}", id, e);
                None
            }
        }
    }

    /// Remove a dead owner's lock. Safe to call repeatedly.
    ///
    /// # Errors
    /// `AlreadyLocked` when a live process still owns the session.
    pub fn recover_session(&self, id: &SessionId) -> Result<RecoveryResult> {
        let (lock_removed, previous_holder) = match self.store.locks().reclaim_stale(id)? {
            Reclaim::Removed(previous) => (true, previous),
            Reclaim::Absent => (false, None),
            Reclaim::Changed => {
                // someone took the session over while we looked
                if let Some(holder) = self.store.locks().is_locked(id)? {
                    return Err(Error::AlreadyLocked {
                        session_id: id.to_string(),
                        holder,
                    });
                }
                (false, None)
            }
        };
        if lock_removed {
            clog!("Recovered session {}", id);
        }
        Ok(RecoveryResult {
            session_id: id.clone(),
            lock_removed,
            previous_holder,
        })
    }

    /// Recover every candidate. A failure on one session is logged and skipped.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let mut cleaned = 0;
        for candidate in self.check_for_recovery()? {
            match self.recover_session(&candidate.session_id) {
                Ok(result) if result.lock_removed => cleaned += 1,
                Ok(_) => {}
                Err(e) => clog_warn!(
                    "cleanup_stale: skipping session {}: {}",
                    candidate.session_id,
                    e
                ),
            }
        }
        if cleaned > 0 {
            clog!("Cleaned up {} stale lock(s)", cleaned);
        }
        Ok(cleaned)
    }

    /// Check that the session file parses and is filed under its own id.
    pub fn validate_session(&self, id: &SessionId) -> Result<()> {
        let path = self.store.session_path(id);
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("session {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        let corrupted = |reason: String| Error::SessionCorrupted {
            id: id.to_string(),
            reason,
        };

        let value: Value =
            serde_json::from_slice(&contents).map_err(|e| corrupted(format!("invalid JSON: {}", e)))?;
        let stored = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if stored.is_empty() {
            return Err(corrupted("missing session id".to_string()));
        }
        if stored != id.as_str() {
            return Err(corrupted(format!(
                "id {:?} does not match storage key {:?}",
                stored,
                id.as_str()
            )));
        }
        Ok(())
    }

    /// Delete unlocked, readable sessions that own no instances.
    pub fn cleanup_empty_sessions(&self) -> Result<Vec<SessionId>> {
        let mut removed = Vec::new();
        for id in self.store.list_ids()? {
            match self.store.locks().is_locked(&id) {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    clog_warn!("cleanup_empty_sessions: skipping {}: {}", id, e);
                    continue;
                }
            }
            let session = match self.store.load(&id) {
                Ok(s) => s,
                Err(e) => {
                    clog_debug!("cleanup_empty_sessions: not touching {}: {}", id, e);
                    continue;
                }
            };
            if !session.instances.is_empty() {
                continue;
            }
            match self.store.delete(&id) {
                Ok(()) => removed.push(id),
                Err(e) => clog_warn!("cleanup_empty_sessions: failed to delete {}: {}", id, e),
            }
        }
        Ok(removed)
    }
}
