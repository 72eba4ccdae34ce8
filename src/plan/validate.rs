//! Plan validation.
//!
//! Problems never abort validation. Every check runs and its findings are
//! collected into one [`ValidationResult`]. Only `Error` severity makes a
//! plan invalid; a plan with warnings is still usable.

use serde::{Deserialize, Serialize};

use super::graph::PlanGraph;
use super::spec::{Complexity, PlanSpec};
use crate::{clog_debug, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_task_ids: Vec<String>,
}

impl ValidationMessage {
    fn new(severity: Severity, task_id: Option<&str>, message: String) -> Self {
        Self {
            severity,
            task_id: task_id.map(str::to_string),
            message,
            suggestion: None,
            related_task_ids: Vec::new(),
        }
    }

    fn error(task_id: Option<&str>, message: String) -> Self {
        Self::new(Severity::Error, task_id, message)
    }

    fn warning(task_id: Option<&str>, message: String) -> Self {
        Self::new(Severity::Warning, task_id, message)
    }

    fn info(task_id: Option<&str>, message: String) -> Self {
        Self::new(Severity::Info, task_id, message)
    }

    fn suggest(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }

    fn related(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.related_task_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

impl std::fmt::Display for ValidationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.task_id {
            Some(id) => write!(f, "[{}] {}: {}", self.severity, id, self.message)?,
            None => write!(f, "[{}] {}", self.severity, self.message)?,
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub messages: Vec<ValidationMessage>,
}

impl ValidationResult {
    pub fn from_messages(messages: Vec<ValidationMessage>) -> Self {
        let count = |s: Severity| messages.iter().filter(|m| m.severity == s).count();
        let error_count = count(Severity::Error);
        Self {
            valid: error_count == 0,
            error_count,
            warning_count: count(Severity::Warning),
            info_count: count(Severity::Info),
            messages,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.by_severity(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.by_severity(Severity::Warning)
    }

    pub fn by_severity(&self, severity: Severity) -> impl Iterator<Item = &ValidationMessage> {
        self.messages.iter().filter(move |m| m.severity == severity)
    }
}

/// Run every structural and advisory check over `plan`.
pub fn validate_plan(plan: &PlanSpec) -> ValidationResult {
    if plan.tasks.is_empty() {
        return ValidationResult::from_messages(vec![ValidationMessage::error(
            None,
            "Plan has no tasks".to_string(),
        )
        .suggest("A plan must contain at least one task")]);
    }

    let graph = PlanGraph::build(&plan.tasks);
    let mut messages = Vec::new();

    check_structure(&graph, plan, &mut messages);
    check_cycles(&graph, &mut messages);
    check_file_conflicts(&graph, &mut messages);
    check_task_quality(&graph, &mut messages);

    let result = ValidationResult::from_messages(messages);
    clog_debug!(
        "validate_plan: tasks={} errors={} warnings={} info={}",
        plan.tasks.len(),
        result.error_count,
        result.warning_count,
        result.info_count
    );
    result
}

/// Validate and turn any error into `ValidationFailed` carrying the errors.
pub fn require_valid(plan: &PlanSpec) -> Result<ValidationResult> {
    let result = validate_plan(plan);
    if result.valid {
        Ok(result)
    } else {
        Err(Error::ValidationFailed(result.errors().cloned().collect()))
    }
}

fn check_structure(graph: &PlanGraph<'_>, plan: &PlanSpec, out: &mut Vec<ValidationMessage>) {
    for (position, task) in plan.tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            out.push(
                ValidationMessage::error(None, format!("Task at position {} has an empty id", position + 1))
                    .suggest("Give every task a unique, non-empty id"),
            );
        }
    }

    for id in graph.duplicates() {
        out.push(
            ValidationMessage::error(Some(*id), format!("Duplicate task id '{}'", id))
                .suggest("Task ids must be unique within a plan"),
        );
    }

    for id in graph.self_dependencies() {
        out.push(
            ValidationMessage::error(Some(*id), format!("Task '{}' depends on itself", id))
                .suggest("Remove the task from its own depends_on list"),
        );
    }

    for (id, dep) in graph.unknown_dependencies() {
        out.push(
            ValidationMessage::error(
                Some(*id),
                format!("Task '{}' depends on unknown task '{}'", id, dep),
            )
            .suggest("Fix the dependency id or add the missing task")
            .related([*dep]),
        );
    }
}

fn check_cycles(graph: &PlanGraph<'_>, out: &mut Vec<ValidationMessage>) {
    let cycles = graph.find_cycles();
    for cycle in &cycles {
        let mut path = cycle.clone();
        if let Some(first) = cycle.first() {
            path.push(first.clone());
        }
        out.push(
            ValidationMessage::error(
                cycle.first().map(String::as_str),
                format!("Dependency cycle detected: {}", path.join(" -> ")),
            )
            .suggest("Remove one of the dependencies to break the cycle")
            .related(cycle.iter().cloned()),
        );
    }

    // Should be unreachable when no cycle was found; re-checked so ordering
    // never silently drops tasks.
    if cycles.is_empty() {
        let layering = graph.execution_layers();
        if !layering.unscheduled.is_empty() {
            out.push(
                ValidationMessage::error(
                    None,
                    format!(
                        "Tasks could not be scheduled: {}",
                        layering.unscheduled.join(", ")
                    ),
                )
                .related(layering.unscheduled.iter().cloned()),
            );
        }
    }
}

/// One warning per file shared by tasks in the same execution layer.
fn check_file_conflicts(graph: &PlanGraph<'_>, out: &mut Vec<ValidationMessage>) {
    let layering = graph.execution_layers();
    for layer in &layering.layers {
        let mut by_file: Vec<(&str, Vec<&str>)> = Vec::new();
        for id in layer {
            let Some(task) = graph.task(id) else {
                continue;
            };
            for file in &task.files {
                match by_file.iter_mut().find(|(f, _)| *f == file.as_str()) {
                    Some((_, owners)) => {
                        if !owners.contains(&task.id.as_str()) {
                            owners.push(task.id.as_str());
                        }
                    }
                    None => by_file.push((file.as_str(), vec![task.id.as_str()])),
                }
            }
        }

        for (file, owners) in by_file {
            if owners.len() < 2 {
                continue;
            }
            out.push(
                ValidationMessage::warning(
                    owners.first().copied(),
                    format!(
                        "File '{}' is modified by tasks in the same execution group: {}",
                        file,
                        owners.join(", ")
                    ),
                )
                .suggest("Add a dependency between these tasks so they run sequentially")
                .related(owners.iter().copied()),
            );
        }
    }
}

fn check_task_quality(graph: &PlanGraph<'_>, out: &mut Vec<ValidationMessage>) {
    for task in graph.tasks() {
        let id = Some(task.id.as_str());
        if task.title.trim().is_empty() {
            out.push(ValidationMessage::warning(id, "Task has no title".to_string()));
        }
        if task.description.trim().is_empty() {
            out.push(
                ValidationMessage::warning(id, "Task has no description".to_string())
                    .suggest("Describe the expected outcome so the worker has enough context"),
            );
        }
        if task.files.is_empty() && !task.no_code {
            out.push(
                ValidationMessage::info(id, "Task does not list any files".to_string())
                    .suggest("List expected files so conflicts can be detected"),
            );
        }
        if task.est_complexity == Complexity::High {
            out.push(
                ValidationMessage::info(id, "Task is estimated as high complexity".to_string())
                    .suggest("Consider splitting it into smaller tasks"),
            );
        }
    }
}
