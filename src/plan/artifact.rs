//! Reading the plan a planner left in its worktree.

use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::spec::{parse_plan_json, PlanSpec};
use crate::config::{Config, DEFAULT_PLAN_FILE};
use crate::{clog_debug, Error, Result};

/// First fenced ```json block in free-form agent output.
static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)```").unwrap());

/// Turns a finished planner's working directory into a plan.
pub trait PlanParser {
    fn parse_plan(&self, worktree: &Path, objective: &str) -> Result<PlanSpec>;
}

/// Reads `<worktree>/<plan_file>`.
#[derive(Debug, Clone)]
pub struct FilePlanParser {
    plan_file: String,
}

impl FilePlanParser {
    pub fn new(plan_file: &str) -> Self {
        Self {
            plan_file: plan_file.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.plan_file)
    }

    pub fn plan_path(&self, worktree: &Path) -> PathBuf {
        worktree.join(&self.plan_file)
    }
}

impl Default for FilePlanParser {
    fn default() -> Self {
        Self::new(DEFAULT_PLAN_FILE)
    }
}

impl PlanParser for FilePlanParser {
    fn parse_plan(&self, worktree: &Path, objective: &str) -> Result<PlanSpec> {
        let path = self.plan_path(worktree);
        clog_debug!("FilePlanParser::parse_plan path={}", path.display());
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::PlanParse(format!(
                    "plan file not found: {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        parse_plan_text(&text, objective)
    }
}

/// Parse a plan from bare JSON or from the first fenced json block, then
/// fill the objective and derived fields.
pub fn parse_plan_text(text: &str, objective: &str) -> Result<PlanSpec> {
    let mut plan = match parse_plan_json(text) {
        Ok(plan) => plan,
        Err(bare_err) => match extract_fenced_json(text) {
            Some(block) => parse_plan_json(block)?,
            None => return Err(bare_err),
        },
    };

    if plan.objective.trim().is_empty() {
        plan.objective = objective.to_string();
    }
    plan.ensure_derived();
    Ok(plan)
}

pub fn extract_fenced_json(text: &str) -> Option<&str> {
    FENCED_JSON_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
