//! Plan data model and ingestion-boundary normalization.
//!
//! `dependency_graph` and `execution_order` are caches derived from `tasks`.
//! They are recomputed whenever they are missing and never trusted over the
//! task list itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::graph::PlanGraph;
use crate::{clog_debug, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Lenient reading of a planner-written label. Unknown labels are
    /// `Medium` so one odd value never costs the whole plan.
    pub fn from_label(label: &str) -> Self {
        let normalized: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '_' || c == ' ' { '-' } else { c })
            .collect();
        match normalized.as_str() {
            "low" | "trivial" | "simple" | "easy" | "small" => Complexity::Low,
            "medium" | "moderate" | "normal" | "mid" => Complexity::Medium,
            "high" | "very-high" | "complex" | "hard" | "large" => Complexity::High,
            _ => {
                clog_debug!("Unknown task complexity {:?}, using medium", label);
                Complexity::Medium
            }
        }
    }
}

impl<'de> Deserialize<'de> for Complexity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(label) => Complexity::from_label(&label),
            _ => Complexity::Medium,
        })
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
        }
    }
}

/// One unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, alias = "depends")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, alias = "complexity")]
    pub est_complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
    /// Task produces no code changes (research, verification).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_code: bool,
}

impl PlannedTask {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            files: Vec::new(),
            depends_on: Vec::new(),
            priority: 0,
            est_complexity: Complexity::Medium,
            issue_url: None,
            no_code: false,
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub execution_order: Vec<Vec<String>>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PlanSpec {
    pub fn new(objective: &str, tasks: Vec<PlannedTask>) -> Self {
        let mut plan = Self {
            id: generate_plan_id(),
            objective: objective.to_string(),
            summary: String::new(),
            tasks,
            dependency_graph: BTreeMap::new(),
            execution_order: Vec::new(),
            insights: Vec::new(),
            constraints: Vec::new(),
            created_at: Utc::now(),
        };
        plan.rederive();
        plan
    }

    pub fn task(&self, id: &str) -> Option<&PlannedTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn needs_derivation(&self) -> bool {
        !self.tasks.is_empty()
            && (self.dependency_graph.is_empty() || self.execution_order.is_empty())
    }

    /// Fill in a missing id and derived fields. Returns true if anything changed.
    pub fn ensure_derived(&mut self) -> bool {
        let mut changed = false;
        if self.id.is_empty() {
            self.id = generate_plan_id();
            changed = true;
        }
        if self.needs_derivation() {
            self.rederive();
            changed = true;
        }
        changed
    }

    /// Recompute `dependency_graph` and `execution_order` from `tasks`.
    ///
    /// Tasks stuck behind a cycle are left out of `execution_order`; the
    /// validator reports the cycle itself.
    pub fn rederive(&mut self) {
        let mut graph = BTreeMap::new();
        for task in &self.tasks {
            graph
                .entry(task.id.clone())
                .or_insert_with(|| task.depends_on.clone());
        }
        self.dependency_graph = graph;

        let layering = PlanGraph::build(&self.tasks).execution_layers();
        if !layering.unscheduled.is_empty() {
            clog_debug!(
                "Plan {}: {} task(s) could not be ordered",
                self.id,
                layering.unscheduled.len()
            );
        }
        self.execution_order = layering.layers;
    }
}

fn generate_plan_id() -> String {
    format!("plan-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Parse plan JSON, accepting both a bare plan and `{"plan": {...}}`.
///
/// Derived fields are not touched; call [`PlanSpec::ensure_derived`].
pub fn parse_plan_json(text: &str) -> Result<PlanSpec> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| Error::PlanParse(format!("invalid JSON: {}", e)))?;
    let value = unwrap_plan(value);
    if !value.is_object() {
        return Err(Error::PlanParse("plan must be a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| Error::PlanParse(e.to_string()))
}

fn unwrap_plan(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("plan").is_some_and(Value::is_object) => {
            map.remove("plan").unwrap_or(Value::Null)
        }
        other => other,
    }
}
