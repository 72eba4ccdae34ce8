//! Resumable drive of plan generation.
//!
//! [`resume`] is a cheap, repeatable poll: call it on every tick or after
//! reattaching. It only advances state that external processes have already
//! made final, and starts the evaluator at most once per planning phase.

use crate::config::DEFAULT_STRATEGIES;
use crate::plan::{require_valid, PlanParser, PlanSpec, ValidationResult};
use crate::process::LivenessProbe;
use crate::session::{AttachedSession, Instance, Session};
use crate::{clog, clog_debug, clog_warn, Error, Result};

use super::state::{MultiPassState, PlanningStrategy, UltraPlanPhase, UltraPlanSession};

/// Resolves planner ids to the worker instances backing them.
pub trait InstanceLookup {
    fn find_instance(&self, id: &str) -> Option<&Instance>;
}

impl InstanceLookup for Session {
    fn find_instance(&self, id: &str) -> Option<&Instance> {
        Session::find_instance(self, id)
    }
}

/// Starts planner and evaluator processes. Returns the instance ids of the
/// processes it started.
pub trait PlanningLauncher {
    fn start_planners(&mut self, objective: &str, strategies: &[String]) -> Result<Vec<String>>;
    fn start_coordinator(&mut self, objective: &str) -> Result<String>;
    fn start_plan_manager(&mut self, objective: &str, candidates: &[PlanSpec]) -> Result<String>;
}

/// Where updated planning state is written.
pub trait StateSink {
    fn persist(&mut self, state: &UltraPlanSession) -> Result<()>;
}

/// Writes planning state into an attached session and saves it.
pub struct SessionSink<'a> {
    attached: &'a mut AttachedSession,
}

impl<'a> SessionSink<'a> {
    pub fn new(attached: &'a mut AttachedSession) -> Self {
        Self { attached }
    }
}

impl InstanceLookup for SessionSink<'_> {
    fn find_instance(&self, id: &str) -> Option<&Instance> {
        self.attached.session().find_instance(id)
    }
}

impl StateSink for SessionSink<'_> {
    fn persist(&mut self, state: &UltraPlanSession) -> Result<()> {
        self.attached.session_mut().ultra_plan = Some(state.clone());
        self.attached.save()
    }
}

/// Collaborators a resume call works through.
pub struct PlanningContext<'a> {
    pub probe: &'a dyn LivenessProbe,
    pub parser: &'a dyn PlanParser,
    pub launcher: &'a mut dyn PlanningLauncher,
    pub strategies: Vec<String>,
}

impl<'a> PlanningContext<'a> {
    pub fn new(
        probe: &'a dyn LivenessProbe,
        parser: &'a dyn PlanParser,
        launcher: &'a mut dyn PlanningLauncher,
    ) -> Self {
        Self {
            probe,
            parser,
            launcher,
            strategies: DEFAULT_STRATEGIES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<String>) -> Self {
        self.strategies = strategies;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing had been started; planning was (re)launched.
    Restarted { planners: usize },
    /// Some planners are still running.
    Waiting { pending: Vec<usize> },
    /// All planners finished and the evaluator was started by this call.
    EvaluatorStarted { evaluator_id: String, candidates: usize },
    /// All planners finished and the evaluator was started earlier.
    AlreadyTriggered,
    /// A single-pass plan was stored.
    PlanReady,
    /// Planning is over; nothing to drive in this phase.
    Settled(UltraPlanPhase),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    pub outcome: ResumeOutcome,
    /// Planner indices that became processed during this call.
    pub newly_processed: Vec<usize>,
    pub warnings: Vec<String>,
    /// Whether the state was saved. Persist failures are logged, not returned.
    pub persisted: bool,
}

impl ResumeReport {
    fn new(outcome: ResumeOutcome) -> Self {
        Self {
            outcome,
            newly_processed: Vec::new(),
            warnings: Vec::new(),
            persisted: false,
        }
    }
}

/// Resume planning for the session's UltraPlan state and write the result
/// back into the session.
pub fn resume_attached(
    attached: &mut AttachedSession,
    ctx: &mut PlanningContext<'_>,
) -> Result<ResumeReport> {
    let mut state = attached
        .session()
        .ultra_plan
        .clone()
        .ok_or_else(|| Error::NotFound(format!("ultraplan state in session {}", attached.id())))?;
    let result = {
        let mut sink = SessionSink::new(attached);
        resume(&mut state, &mut sink, ctx)
    };
    attached.session_mut().ultra_plan = Some(state);
    result
}

/// Advance planning as far as external state allows.
///
/// # Errors
/// `PlanningExhausted` when every planner finished without a usable plan;
/// the state is left in `failed`. Launcher errors are returned as is.
pub fn resume<H>(
    state: &mut UltraPlanSession,
    host: &mut H,
    ctx: &mut PlanningContext<'_>,
) -> Result<ResumeReport>
where
    H: InstanceLookup + StateSink + ?Sized,
{
    clog_debug!(
        "resume: ultraplan={} phase={} multi_pass={}",
        state.id,
        state.phase,
        state.strategy.is_multi_pass()
    );
    match state.phase {
        UltraPlanPhase::Planning | UltraPlanPhase::PlanSelection => {}
        UltraPlanPhase::Failed if !has_started(state) => {}
        phase => return Ok(ResumeReport::new(ResumeOutcome::Settled(phase))),
    }

    if state.strategy.is_multi_pass() {
        resume_multi_pass(state, host, ctx)
    } else {
        resume_single_pass(state, host, ctx)
    }
}

fn has_started(state: &UltraPlanSession) -> bool {
    match &state.strategy {
        PlanningStrategy::SinglePass { coordinator_id } => coordinator_id.is_some(),
        PlanningStrategy::MultiPass(mp) => !mp.plan_coordinator_ids.is_empty(),
    }
}

/// Per-planner result of one polling pass.
enum Poll {
    Pending(Vec<usize>),
    Done,
}

fn resume_multi_pass<H>(
    state: &mut UltraPlanSession,
    host: &mut H,
    ctx: &mut PlanningContext<'_>,
) -> Result<ResumeReport>
where
    H: InstanceLookup + StateSink + ?Sized,
{
    let objective = state.objective.clone();

    if !has_started(state) {
        state.restart_planning()?;
        let ids = ctx.launcher.start_planners(&objective, &ctx.strategies)?;
        let planners = ids.len();
        if let Some(mp) = state.multi_pass_state_mut() {
            mp.plan_coordinator_ids = ids;
            mp.ensure_capacity();
        }
        clog!("Started {} planner(s) for ultraplan {}", planners, state.id);
        let mut report = ResumeReport::new(ResumeOutcome::Restarted { planners });
        report.persisted = persist_best_effort(host, state);
        return Ok(report);
    }

    let mut newly_processed = Vec::new();
    let mut warnings = Vec::new();
    let poll = match state.multi_pass_state_mut() {
        Some(mp) => poll_planners(mp, &*host, ctx, &objective, &mut newly_processed, &mut warnings),
        None => Poll::Done,
    };

    let finish = |outcome, persisted| ResumeReport {
        outcome,
        newly_processed: newly_processed.clone(),
        warnings: warnings.clone(),
        persisted,
    };

    if let Poll::Pending(pending) = poll {
        let persisted = !newly_processed.is_empty() && persist_best_effort(host, state);
        return Ok(finish(ResumeOutcome::Waiting { pending }, persisted));
    }

    let (already_started, candidates) = match state.multi_pass_state() {
        Some(mp) => (mp.evaluator_started(), mp.candidates()),
        None => (false, Vec::new()),
    };

    if already_started {
        let persisted = !newly_processed.is_empty() && persist_best_effort(host, state);
        return Ok(finish(ResumeOutcome::AlreadyTriggered, persisted));
    }

    if candidates.is_empty() {
        clog_warn!(
            "All planners for ultraplan {} finished without a usable plan",
            state.id
        );
        state.fail(&Error::PlanningExhausted.to_string());
        persist_best_effort(host, state);
        return Err(Error::PlanningExhausted);
    }

    let evaluator_id = ctx.launcher.start_plan_manager(&objective, &candidates)?;
    if let Some(mp) = state.multi_pass_state_mut() {
        mp.plan_manager_id = Some(evaluator_id.clone());
    }
    if state.phase == UltraPlanPhase::Planning {
        state.transition(UltraPlanPhase::PlanSelection)?;
    }
    clog!(
        "Evaluator {} started over {} candidate plan(s) for ultraplan {}",
        evaluator_id,
        candidates.len(),
        state.id
    );
    let persisted = persist_best_effort(host, state);
    Ok(finish(
        ResumeOutcome::EvaluatorStarted {
            evaluator_id,
            candidates: candidates.len(),
        },
        persisted,
    ))
}

fn poll_planners<H>(
    mp: &mut MultiPassState,
    host: &H,
    ctx: &PlanningContext<'_>,
    objective: &str,
    newly_processed: &mut Vec<usize>,
    warnings: &mut Vec<String>,
) -> Poll
where
    H: InstanceLookup + ?Sized,
{
    mp.ensure_capacity();
    let mut pending = Vec::new();

    for (index, planner_id) in mp.plan_coordinator_ids.clone().iter().enumerate() {
        if mp.is_processed(index) {
            continue;
        }
        let candidate = match host.find_instance(planner_id) {
            None => {
                let msg = format!("Planner {} ({}) no longer exists", index + 1, planner_id);
                clog_warn!("{}", msg);
                warnings.push(msg);
                None
            }
            Some(instance) if ctx.probe.is_running(instance) => {
                pending.push(index);
                continue;
            }
            Some(instance) => match ctx.parser.parse_plan(&instance.worktree_path, objective) {
                Ok(plan) => {
                    clog_debug!(
                        "Planner {} produced plan {} with {} task(s)",
                        index + 1,
                        plan.id,
                        plan.tasks.len()
                    );
                    Some(plan)
                }
                Err(e) => {
                    let msg = format!(
                        "Planner {} ({}) finished but its plan could not be parsed: {}",
                        index + 1,
                        planner_id,
                        e
                    );
                    clog_warn!("{}", msg);
                    warnings.push(msg);
                    None
                }
            },
        };
        if mp.mark_processed(index, candidate) {
            newly_processed.push(index);
        }
    }

    if pending.is_empty() {
        Poll::Done
    } else {
        Poll::Pending(pending)
    }
}

fn resume_single_pass<H>(
    state: &mut UltraPlanSession,
    host: &mut H,
    ctx: &mut PlanningContext<'_>,
) -> Result<ResumeReport>
where
    H: InstanceLookup + StateSink + ?Sized,
{
    let objective = state.objective.clone();
    let coordinator_id = match &state.strategy {
        PlanningStrategy::SinglePass { coordinator_id } => coordinator_id.clone(),
        PlanningStrategy::MultiPass(_) => None,
    };

    let Some(coordinator_id) = coordinator_id else {
        state.restart_planning()?;
        let id = ctx.launcher.start_coordinator(&objective)?;
        clog!("Started coordinator {} for ultraplan {}", id, state.id);
        state.strategy = PlanningStrategy::SinglePass {
            coordinator_id: Some(id),
        };
        let mut report = ResumeReport::new(ResumeOutcome::Restarted { planners: 1 });
        report.persisted = persist_best_effort(host, state);
        return Ok(report);
    };

    let parsed = match host.find_instance(&coordinator_id) {
        None => Err(format!("Coordinator {} no longer exists", coordinator_id)),
        Some(instance) if ctx.probe.is_running(instance) => {
            return Ok(ResumeReport::new(ResumeOutcome::Waiting { pending: vec![0] }));
        }
        Some(instance) => ctx
            .parser
            .parse_plan(&instance.worktree_path, &objective)
            .map_err(|e| format!("Coordinator {} plan could not be parsed: {}", coordinator_id, e)),
    };

    match parsed {
        Ok(plan) => {
            clog!(
                "Plan {} ready for ultraplan {} ({} task(s))",
                plan.id,
                state.id,
                plan.tasks.len()
            );
            state.plan = Some(plan);
            state.transition(UltraPlanPhase::PlanReady)?;
            let mut report = ResumeReport::new(ResumeOutcome::PlanReady);
            report.newly_processed.push(0);
            report.persisted = persist_best_effort(host, state);
            Ok(report)
        }
        Err(msg) => {
            clog_warn!("{}", msg);
            state.fail(&msg);
            persist_best_effort(host, state);
            Err(Error::PlanningExhausted)
        }
    }
}

fn persist_best_effort<H>(host: &mut H, state: &UltraPlanSession) -> bool
where
    H: StateSink + ?Sized,
{
    match host.persist(state) {
        Ok(()) => true,
        Err(e) => {
            clog_warn!("Failed to persist ultraplan {}: {}", state.id, e);
            false
        }
    }
}

/// Accept the evaluator's final plan: normalize it, refuse it when it has
/// validation errors, otherwise store it and move to `plan_ready`.
pub fn complete_plan_selection(
    state: &mut UltraPlanSession,
    mut plan: PlanSpec,
) -> Result<ValidationResult> {
    if !state.phase.can_transition(UltraPlanPhase::PlanReady) {
        return Err(Error::InvalidPhaseTransition {
            from: state.phase.to_string(),
            to: UltraPlanPhase::PlanReady.to_string(),
        });
    }
    if plan.objective.trim().is_empty() {
        plan.objective = state.objective.clone();
    }
    plan.ensure_derived();
    let result = require_valid(&plan)?;

    state.plan = Some(plan);
    state.transition(UltraPlanPhase::PlanReady)?;
    clog!(
        "Plan selected for ultraplan {} ({} warning(s))",
        state.id,
        result.warning_count
    );
    Ok(result)
}
