//! Persisted UltraPlan state and phase transitions.
//!
//! The planning strategy is a closed tagged union keyed by `mode`, so a
//! session file always round-trips into the same typed shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::config::Config;
use crate::plan::PlanSpec;
use crate::{Error, Result};

/// Planning -> PlanSelection -> PlanReady -> Executing -> Synthesis -> Complete
///
/// Single-pass planning skips PlanSelection. Any non-terminal phase may move
/// to Failed, and Failed may restart at Planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UltraPlanPhase {
    #[default]
    Planning,
    PlanSelection,
    PlanReady,
    Executing,
    Synthesis,
    Complete,
    Failed,
}

impl UltraPlanPhase {
    pub fn can_transition(self, target: UltraPlanPhase) -> bool {
        use UltraPlanPhase::*;
        matches!(
            (self, target),
            (Planning, PlanSelection)
                | (Planning, PlanReady)
                | (PlanSelection, PlanReady)
                | (PlanReady, Executing)
                | (Executing, Synthesis)
                | (Synthesis, Complete)
                | (Failed, Planning)
        ) || (target == Failed && !self.is_terminal())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UltraPlanPhase::Complete | UltraPlanPhase::Failed)
    }

    /// Phases after planning has produced a plan.
    pub fn has_plan(self) -> bool {
        matches!(
            self,
            UltraPlanPhase::PlanReady
                | UltraPlanPhase::Executing
                | UltraPlanPhase::Synthesis
                | UltraPlanPhase::Complete
        )
    }
}

impl std::fmt::Display for UltraPlanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UltraPlanPhase::Planning => write!(f, "planning"),
            UltraPlanPhase::PlanSelection => write!(f, "plan_selection"),
            UltraPlanPhase::PlanReady => write!(f, "plan_ready"),
            UltraPlanPhase::Executing => write!(f, "executing"),
            UltraPlanPhase::Synthesis => write!(f, "synthesis"),
            UltraPlanPhase::Complete => write!(f, "complete"),
            UltraPlanPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of N independent planners toward one evaluator run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MultiPassState {
    #[serde(default)]
    pub plan_coordinator_ids: Vec<String>,
    #[serde(default)]
    pub processed_coordinators: BTreeSet<usize>,
    #[serde(default)]
    pub candidate_plans: Vec<Option<PlanSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_manager_id: Option<String>,
}

impl MultiPassState {
    pub fn planner_count(&self) -> usize {
        self.plan_coordinator_ids.len()
    }

    /// Grow `candidate_plans` to at least one slot per planner.
    pub fn ensure_capacity(&mut self) {
        let n = self.planner_count();
        if self.candidate_plans.len() < n {
            self.candidate_plans.resize(n, None);
        }
    }

    pub fn is_processed(&self, index: usize) -> bool {
        self.processed_coordinators.contains(&index)
    }

    /// Record the outcome for planner `index`. Returns false if it was
    /// already processed, in which case nothing changes.
    pub fn mark_processed(&mut self, index: usize, candidate: Option<PlanSpec>) -> bool {
        if self.is_processed(index) {
            return false;
        }
        self.ensure_capacity();
        if index >= self.candidate_plans.len() {
            self.candidate_plans.resize(index + 1, None);
        }
        self.candidate_plans[index] = candidate;
        self.processed_coordinators.insert(index);
        true
    }

    pub fn pending(&self) -> Vec<usize> {
        (0..self.planner_count())
            .filter(|i| !self.is_processed(*i))
            .collect()
    }

    pub fn all_processed(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn candidates(&self) -> Vec<PlanSpec> {
        self.candidate_plans.iter().flatten().cloned().collect()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidate_plans.iter().flatten().count()
    }

    pub fn evaluator_started(&self) -> bool {
        self.plan_manager_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PlanningStrategy {
    SinglePass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinator_id: Option<String>,
    },
    MultiPass(MultiPassState),
}

impl PlanningStrategy {
    pub fn is_multi_pass(&self) -> bool {
        matches!(self, PlanningStrategy::MultiPass(_))
    }

    /// Forget every started process so planning can begin again.
    fn reset(&mut self) {
        match self {
            PlanningStrategy::SinglePass { coordinator_id } => *coordinator_id = None,
            PlanningStrategy::MultiPass(state) => *state = MultiPassState::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UltraPlanSession {
    pub id: String,
    pub objective: String,
    #[serde(default)]
    pub phase: UltraPlanPhase,
    pub strategy: PlanningStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSpec>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UltraPlanSession {
    fn new(objective: &str, strategy: PlanningStrategy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            objective: objective.to_string(),
            phase: UltraPlanPhase::Planning,
            strategy,
            plan: None,
            created_at: Utc::now(),
            error: None,
        }
    }

    pub fn single_pass(objective: &str) -> Self {
        Self::new(
            objective,
            PlanningStrategy::SinglePass {
                coordinator_id: None,
            },
        )
    }

    pub fn multi_pass(objective: &str) -> Self {
        Self::new(objective, PlanningStrategy::MultiPass(MultiPassState::default()))
    }

    /// Fresh planning state in the mode the configuration selects.
    pub fn from_config(objective: &str, config: &Config) -> Self {
        if config.multi_pass {
            Self::multi_pass(objective)
        } else {
            Self::single_pass(objective)
        }
    }

    pub fn multi_pass_state(&self) -> Option<&MultiPassState> {
        match &self.strategy {
            PlanningStrategy::MultiPass(state) => Some(state),
            PlanningStrategy::SinglePass { .. } => None,
        }
    }

    pub fn multi_pass_state_mut(&mut self) -> Option<&mut MultiPassState> {
        match &mut self.strategy {
            PlanningStrategy::MultiPass(state) => Some(state),
            PlanningStrategy::SinglePass { .. } => None,
        }
    }

    pub fn transition(&mut self, target: UltraPlanPhase) -> Result<()> {
        if !self.phase.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }
        self.phase = target;
        Ok(())
    }

    /// Move to `failed` with a reason. No-op once terminal.
    pub fn fail(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = UltraPlanPhase::Failed;
        self.error = Some(reason.to_string());
    }

    /// Start planning over: clears started processes, candidates and any
    /// previous error, and returns to `planning`.
    pub fn restart_planning(&mut self) -> Result<()> {
        if self.phase != UltraPlanPhase::Planning {
            self.transition(UltraPlanPhase::Planning)?;
        }
        self.strategy.reset();
        self.plan = None;
        self.error = None;
        Ok(())
    }
}
