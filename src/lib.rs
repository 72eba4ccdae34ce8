pub mod config;
pub mod error;
pub mod log;
pub mod plan;
pub mod process;
pub mod session;
pub mod tmux;
pub mod ultraplan;

pub use error::{Error, Result};
pub use plan::{PlanSpec, PlannedTask, ValidationResult};
pub use session::{Session, SessionId, SessionManager, SessionStore};
pub use ultraplan::{UltraPlanPhase, UltraPlanSession};
