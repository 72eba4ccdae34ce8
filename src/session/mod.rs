//! Session persistence: data model, locking, storage and recovery.

pub mod group;
pub mod lock;
pub mod manager;
pub mod model;
pub mod recovery;
pub mod store;

pub use group::{prune_groups, GroupPhase, InstanceGroup};
pub use lock::{LockInfo, LockManager, Reclaim, SessionLock, LOCK_FILE};
pub use manager::{AttachedSession, SessionManager};
pub use model::{Instance, InstanceStatus, Session, SessionId};
pub use recovery::{RecoveryCandidate, RecoveryManager, RecoveryReason, RecoveryResult};
pub use store::{SessionInfo, SessionStore, SESSION_FILE};
