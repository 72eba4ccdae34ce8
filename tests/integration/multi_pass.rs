//! Multi-pass planning resumed through a real attached session.

use claudio::config::DEFAULT_STRATEGIES;
use claudio::plan::FilePlanParser;
use claudio::process::ProcessProbe;
use claudio::ultraplan::{
    complete_plan_selection, resume_attached, PlanningContext, ResumeOutcome, UltraPlanPhase,
    UltraPlanSession,
};
use claudio::Error;

use crate::fixtures::{diamond_plan_json, RecordingLauncher, TestEnv};

#[test]
fn test_three_planners_one_broken_artifact() {
    let env = TestEnv::new();
    let manager = env.manager();
    let mut attached = manager.create("multi", env.path()).unwrap();
    let id = attached.id().clone();

    let mut launcher = RecordingLauncher::with_planners(&["plan-1", "plan-2", "plan-3"]);
    let probe = ProcessProbe;
    let parser = FilePlanParser::from_config(&env.config);

    attached.session_mut().ultra_plan = Some(UltraPlanSession::multi_pass("add search"));

    // first call: nothing started yet
    {
        let mut ctx = PlanningContext::new(&probe, &parser, &mut launcher)
            .with_strategies(env.config.strategies.clone());
        let report = resume_attached(&mut attached, &mut ctx).unwrap();
        assert_eq!(report.outcome, ResumeOutcome::Restarted { planners: 3 });
    }
    assert_eq!(launcher.planner_calls.len(), 1);
    assert_eq!(launcher.planner_calls[0].len(), DEFAULT_STRATEGIES.len());

    // planners finish: the second one writes garbage
    {
        let session = attached.session_mut();
        session.add_instance(env.planner("plan-1", Some(&diamond_plan_json("first"))));
        session.add_instance(env.planner("plan-2", Some("I could not produce a plan.")));
        session.add_instance(env.planner("plan-3", Some(&diamond_plan_json("third"))));
    }

    let report = {
        let mut ctx = PlanningContext::new(&probe, &parser, &mut launcher);
        resume_attached(&mut attached, &mut ctx).unwrap()
    };
    assert_eq!(
        report.outcome,
        ResumeOutcome::EvaluatorStarted {
            evaluator_id: "evaluator-1".to_string(),
            candidates: 2
        }
    );
    assert_eq!(report.newly_processed, vec![0, 1, 2]);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("plan-2"));
    assert!(report.persisted);

    assert_eq!(launcher.evaluator_calls.len(), 1);
    let summaries: Vec<&str> = launcher.evaluator_calls[0]
        .iter()
        .map(|p| p.summary.as_str())
        .collect();
    assert_eq!(summaries, vec!["first", "third"]);

    // state made it to disk
    attached.detach().unwrap();
    let on_disk = env.store().load(&id).unwrap();
    let state = on_disk.ultra_plan.unwrap();
    assert_eq!(state.phase, UltraPlanPhase::PlanSelection);
    let mp = state.multi_pass_state().unwrap();
    assert_eq!(mp.processed_coordinators.len(), 3);
    assert!(mp.candidate_plans[1].is_none());
    assert_eq!(mp.plan_manager_id.as_deref(), Some("evaluator-1"));
}

#[test]
fn test_resume_after_reattach_is_idempotent() {
    let env = TestEnv::new();
    let manager = env.manager();
    let probe = ProcessProbe;
    let parser = FilePlanParser::from_config(&env.config);
    let mut launcher = RecordingLauncher::with_planners(&["p-a", "p-b"]);

    let id = {
        let mut attached = manager.create("idempotent", env.path()).unwrap();
        let mut state = UltraPlanSession::multi_pass("objective");
        state.multi_pass_state_mut().unwrap().plan_coordinator_ids =
            vec!["p-a".to_string(), "p-b".to_string()];
        let session = attached.session_mut();
        session.ultra_plan = Some(state);
        session.add_instance(env.planner("p-a", Some(&diamond_plan_json("a"))));
        session.add_instance(env.planner("p-b", Some(&diamond_plan_json("b"))));

        let mut ctx = PlanningContext::new(&probe, &parser, &mut launcher);
        let report = resume_attached(&mut attached, &mut ctx).unwrap();
        assert!(matches!(
            report.outcome,
            ResumeOutcome::EvaluatorStarted { candidates: 2, .. }
        ));
        attached.detach().unwrap().id
    };

    // a restarted process picks the session back up
    let mut attached = manager.attach(&id).unwrap();
    for _ in 0..2 {
        let mut ctx = PlanningContext::new(&probe, &parser, &mut launcher);
        let report = resume_attached(&mut attached, &mut ctx).unwrap();
        assert_eq!(report.outcome, ResumeOutcome::AlreadyTriggered);
        assert!(report.newly_processed.is_empty());
    }
    assert_eq!(launcher.evaluator_calls.len(), 1);

    // the evaluator's merged plan completes selection
    let merged = claudio::plan::parse_plan_text(&diamond_plan_json("merged"), "").unwrap();
    let state = attached.session_mut().ultra_plan.as_mut().unwrap();
    let result = complete_plan_selection(state, merged).unwrap();
    assert!(result.valid);
    assert_eq!(state.phase, UltraPlanPhase::PlanReady);
    assert_eq!(state.plan.as_ref().unwrap().objective, "objective");
    attached.save().unwrap();
}

#[test]
fn test_every_planner_failing_fails_the_phase() {
    let env = TestEnv::new();
    let manager = env.manager();
    let probe = ProcessProbe;
    let parser = FilePlanParser::from_config(&env.config);
    let mut launcher = RecordingLauncher::default();

    let mut attached = manager.create("doomed", env.path()).unwrap();
    let mut state = UltraPlanSession::multi_pass("objective");
    state.multi_pass_state_mut().unwrap().plan_coordinator_ids =
        vec!["gone".to_string(), "empty".to_string()];
    attached.session_mut().ultra_plan = Some(state);
    attached
        .session_mut()
        .add_instance(env.planner("empty", None));

    let err = {
        let mut ctx = PlanningContext::new(&probe, &parser, &mut launcher);
        resume_attached(&mut attached, &mut ctx).unwrap_err()
    };
    assert!(matches!(err, Error::PlanningExhausted));
    assert!(launcher.evaluator_calls.is_empty());

    let id = attached.detach().unwrap().id;
    let state = env.store().load(&id).unwrap().ultra_plan.unwrap();
    assert_eq!(state.phase, UltraPlanPhase::Failed);
    assert!(state.error.unwrap().contains("no valid plans"));
}
