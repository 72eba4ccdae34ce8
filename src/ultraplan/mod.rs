//! UltraPlan: planning across one or several planner processes.

pub mod resume;
pub mod state;

pub use resume::{
    complete_plan_selection, resume, resume_attached, InstanceLookup, PlanningContext,
    PlanningLauncher, ResumeOutcome, ResumeReport, SessionSink, StateSink,
};
pub use state::{MultiPassState, PlanningStrategy, UltraPlanPhase, UltraPlanSession};
