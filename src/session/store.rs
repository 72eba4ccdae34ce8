//! Atomic JSON persistence for sessions.
//!
//! Every write goes to a temp file in the destination directory, is synced,
//! then renamed over the target. Readers see the old file or the new one,
//! never a torn write.

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::lock::{LockInfo, LockManager, WriteGuard};
use super::{Session, SessionId};
use crate::config::Config;
use crate::process::current_pid;
use crate::{clog, clog_debug, clog_trace, clog_warn, Error, Result};

pub const SESSION_FILE: &str = "session.json";

/// Cheap per-session summary produced by [`SessionStore::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub created: DateTime<Utc>,
    pub instance_count: usize,
    /// Live holder of the session lock, if any.
    pub locked_by: Option<LockInfo>,
}

impl SessionInfo {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

/// Only the fields `list` needs; instances are counted, not parsed.
#[derive(Deserialize)]
struct SessionHeader {
    id: SessionId,
    #[serde(default)]
    name: String,
    created: DateTime<Utc>,
    #[serde(default)]
    instances: ElementCount,
}

#[derive(Default)]
struct ElementCount(usize);

impl<'de> Deserialize<'de> for ElementCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct CountVisitor;

        impl<'de> Visitor<'de> for CountVisitor {
            type Value = ElementCount;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a sequence or null")
            }

            fn visit_unit<E>(self) -> std::result::Result<ElementCount, E> {
                Ok(ElementCount(0))
            }

            fn visit_none<E>(self) -> std::result::Result<ElementCount, E> {
                Ok(ElementCount(0))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<ElementCount, A::Error> {
                let mut n = 0;
                while seq.next_element::<IgnoredAny>()?.is_some() {
                    n += 1;
                }
                Ok(ElementCount(n))
            }
        }

        deserializer.deserialize_any(CountVisitor)
    }
}

#[derive(Serialize, Deserialize)]
struct Versioned<T> {
    version: u64,
    data: T,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u64,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
    locks: LockManager,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        let sessions_dir = sessions_dir.into();
        Self {
            locks: LockManager::new(sessions_dir.clone()),
            sessions_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sessions_dir())
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.sessions_dir.join(id.as_str())
    }

    pub fn session_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(SESSION_FILE)
    }

    pub fn exists(&self, id: &SessionId) -> bool {
        self.session_path(id).exists()
    }

    /// Persist the whole session atomically. Callers must hold its lock.
    pub fn save(&self, session: &Session) -> Result<()> {
        session.validate()?;
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir)?;
        let contents = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.session_path(&session.id), &contents)?;
        clog_debug!(
            "Session saved: id={} instances={}",
            session.id.short(),
            session.instances.len()
        );
        Ok(())
    }

    /// # Errors
    /// `NotFound` when there is no session file, `SessionCorrupted` when it
    /// exists but does not parse.
    pub fn load(&self, id: &SessionId) -> Result<Session> {
        let path = self.session_path(id);
        clog_debug!("SessionStore::load path={}", path.display());
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("session {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&contents).map_err(|e| Error::SessionCorrupted {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Session directories whose names are valid ids, sorted.
    pub fn list_ids(&self) -> Result<Vec<SessionId>> {
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match SessionId::parse(&name) {
                Ok(id) => ids.push(id),
                Err(_) => clog_trace!("Skipping non-session directory {:?}", name),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Summaries of all readable sessions, newest first.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        let mut infos = Vec::new();
        for id in self.list_ids()? {
            let path = self.session_path(&id);
            let contents = match fs::read(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    clog_warn!("Skipping session {}: {}", id, e);
                    continue;
                }
            };
            let header: SessionHeader = match serde_json::from_slice(&contents) {
                Ok(h) => h,
                Err(e) => {
                    clog_warn!("Skipping corrupted session {}: {}", id, e);
                    continue;
                }
            };
            let locked_by = self.locks.is_locked(&id)?;
            infos.push(SessionInfo {
                id: header.id,
                name: header.name,
                created: header.created,
                instance_count: header.instances.0,
                locked_by,
            });
        }
        infos.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(infos)
    }

    /// Remove a session directory. Refuses while another live process holds it.
    pub fn delete(&self, id: &SessionId) -> Result<()> {
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(Error::NotFound(format!("session {}", id)));
        }
        if let Some(holder) = self.locks.is_locked(id)? {
            if holder.pid != current_pid() {
                return Err(Error::AlreadyLocked {
                    session_id: id.to_string(),
                    holder,
                });
            }
        }
        fs::remove_dir_all(&dir)?;
        clog!("Session deleted: id={}", id);
        Ok(())
    }

    pub fn versioned_path(&self, id: &SessionId, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.session_dir(id).join(format!("{}.json", key)))
    }

    /// Optimistic write of an independently versioned sub-object.
    ///
    /// `expected` is the version the caller last read; `0` means "must not
    /// exist yet". Returns the new version. The compare and the write happen
    /// under a short-lived per-key write lock, so of several writers holding
    /// the same `expected` exactly one succeeds.
    ///
    /// # Errors
    /// `StaleData` when the stored version differs from `expected`.
    pub fn save_versioned<T: Serialize>(
        &self,
        id: &SessionId,
        key: &str,
        value: &T,
        expected: u64,
    ) -> Result<u64> {
        let path = self.versioned_path(id, key)?;
        fs::create_dir_all(self.session_dir(id))?;
        let _guard = WriteGuard::acquire(&write_lock_path(&path), id)?;

        let current = read_version(&path)?.unwrap_or(0);
        if current != expected {
            return Err(Error::StaleData {
                key: key.to_string(),
                expected,
                actual: current,
            });
        }

        let next = expected + 1;
        let contents = serde_json::to_vec_pretty(&Versioned {
            version: next,
            data: value,
        })?;
        write_atomic(&path, &contents)?;
        clog_debug!("Versioned write: session={} key={} v={}", id.short(), key, next);
        Ok(next)
    }

    pub fn load_versioned<T: DeserializeOwned>(&self, id: &SessionId, key: &str) -> Result<(T, u64)> {
        let path = self.versioned_path(id, key)?;
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{} for session {}", key, id)));
            }
            Err(e) => return Err(e.into()),
        };
        let versioned: Versioned<T> =
            serde_json::from_slice(&contents).map_err(|e| Error::SessionCorrupted {
                id: id.to_string(),
                reason: format!("{}: {}", key, e),
            })?;
        Ok((versioned.data, versioned.version))
    }
}

fn write_lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Temp file in the target's directory, fsync, rename over the target.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("Path has no parent: {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn read_version(path: &Path) -> Result<Option<u64>> {
    let contents = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let header: VersionHeader = serde_json::from_slice(&contents)?;
    Ok(Some(header.version))
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key != "session"
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid versioned key: {:?}", key)))
    }
}
