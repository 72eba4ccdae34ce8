//! SessionManager - lock-then-load entry point for owning a session.

use std::path::PathBuf;

use super::lock::SessionLock;
use super::recovery::RecoveryManager;
use super::store::SessionStore;
use super::{Session, SessionId};
use crate::config::Config;
use crate::{clog, clog_debug, Error, Result};

/// Creates and attaches sessions, always taking the lock before touching
/// the session file.
pub struct SessionManager {
    store: SessionStore,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(SessionStore::from_config(config))
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(self.store.clone())
    }

    /// Start a new session under a fresh id and return it attached.
    pub fn create(&self, name: &str, base_repo: impl Into<PathBuf>) -> Result<AttachedSession> {
        self.create_from(Session::new(name, base_repo)?)
    }

    /// Persist a caller-built session under its own id and return it attached.
    ///
    /// # Errors
    /// `AlreadyExists` if a session is already stored under that id,
    /// `AlreadyLocked` if another process holds its lock.
    pub fn create_from(&self, session: Session) -> Result<AttachedSession> {
        session.validate()?;
        let lock = self.store.locks().acquire(&session.id)?;
        if self.store.exists(&session.id) {
            return Err(Error::AlreadyExists(format!("session {}", session.id)));
        }
        self.store.save(&session)?;
        clog!("Session created: id={} name={}", session.id, session.name);
        Ok(AttachedSession {
            session,
            lock,
            store: self.store.clone(),
        })
    }

    /// Take ownership of an existing session.
    ///
    /// Group trees are pruned against the instances actually present. When
    /// pruning changed anything the cleaned session is written back.
    ///
    /// # Errors
    /// `AlreadyLocked` if another live process owns it, `NotFound` or
    /// `SessionCorrupted` from the load. The lock is released on failure.
    pub fn attach(&self, id: &SessionId) -> Result<AttachedSession> {
        clog_debug!("SessionManager::attach id={}", id);
        let lock = self.store.locks().acquire(id)?;
        let mut session = self.store.load(id)?;

        if session.prune_groups() {
            clog!("Pruned dangling group references in session {}", id);
            self.store.save(&session)?;
        }

        Ok(AttachedSession {
            session,
            lock,
            store: self.store.clone(),
        })
    }
}

/// A loaded session together with the lock that entitles us to write it.
#[derive(Debug)]
pub struct AttachedSession {
    session: Session,
    lock: SessionLock,
    store: SessionStore,
}

impl AttachedSession {
    pub fn id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn save(&self) -> Result<()> {
        if self.lock.is_released() {
            return Err(Error::LockNotHeld(self.session.id.to_string()));
        }
        self.store.save(&self.session)
    }

    /// Release the lock and hand back the last in-memory state.
    pub fn detach(mut self) -> Result<Session> {
        self.lock.release()?;
        clog_debug!("Session detached: id={}", self.session.id);
        Ok(self.session)
    }
}
