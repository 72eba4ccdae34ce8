//! Task-dependency planning: plan model, graph, validation and ingestion.

pub mod artifact;
pub mod graph;
pub mod spec;
pub mod validate;

pub use artifact::{parse_plan_text, FilePlanParser, PlanParser};
pub use graph::{Layering, PlanGraph};
pub use spec::{parse_plan_json, Complexity, PlanSpec, PlannedTask};
pub use validate::{require_valid, validate_plan, Severity, ValidationMessage, ValidationResult};
