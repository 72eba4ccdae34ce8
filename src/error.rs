use thiserror::Error;

use crate::plan::ValidationMessage;
use crate::session::LockInfo;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error(
        "Session {session_id} is locked by pid {} on {}",
        .holder.pid,
        .holder.hostname
    )]
    AlreadyLocked {
        session_id: String,
        holder: LockInfo,
    },

    #[error("Lock not held for session {0}")]
    LockNotHeld(String),

    #[error("Session {id} is corrupted: {reason}")]
    SessionCorrupted { id: String, reason: String },

    #[error("Stale data for {key}: expected version {expected}, found {actual}")]
    StaleData {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Plan validation failed with {} error(s)", .0.len())]
    ValidationFailed(Vec<ValidationMessage>),

    #[error("All planners completed but no valid plans were produced")]
    PlanningExhausted,

    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
