//! Session lifecycle across simulated process boundaries.

use std::fs;

use chrono::Utc;
use claudio::process::{current_pid, hostname};
use claudio::session::{
    GroupPhase, Instance, InstanceGroup, InstanceStatus, LockInfo, RecoveryManager,
    RecoveryReason, SessionId,
};
use claudio::ultraplan::UltraPlanSession;
use claudio::{Error, PlanSpec, PlannedTask};

use crate::fixtures::{dead_pid, TestEnv};

fn plant_lock(env: &TestEnv, id: &SessionId, pid: u32) {
    let info = LockInfo {
        session_id: id.to_string(),
        pid,
        hostname: hostname(),
        started_at: Utc::now(),
    };
    let path = env.store().locks().lock_path(id);
    fs::write(path, serde_json::to_string(&info).unwrap()).unwrap();
}

#[test]
fn test_full_session_roundtrip_through_attach() {
    let env = TestEnv::new();
    let manager = env.manager();

    let mut attached = manager.create("payments refactor", env.path()).unwrap();
    let id = attached.id().clone();
    {
        let session = attached.session_mut();
        let mut a = env.planner("aaaa0001", None);
        a.status = InstanceStatus::Completed;
        a.files_modified = vec!["src/pay.rs".to_string()];
        a.claude_session_id = Some("conv-a".to_string());
        session.add_instance(a);
        let mut b = env.planner("aaaa0002", None);
        b.status = InstanceStatus::Working;
        b.tmux_session = Some("claudio-aaaa0002".to_string());
        session.add_instance(b);

        let mut group = InstanceGroup::new("Group 1");
        group.phase = GroupPhase::Executing;
        group.instances = vec!["aaaa0001".to_string()];
        let mut sub = InstanceGroup::new("Group 1b");
        sub.instances = vec!["aaaa0002".to_string()];
        sub.execution_order = 1;
        group.add_sub_group(sub);
        session.groups.push(group);

        let mut ultra = UltraPlanSession::multi_pass("refactor payments");
        {
            let mp = ultra.multi_pass_state_mut().unwrap();
            mp.plan_coordinator_ids = vec!["aaaa0001".to_string(), "aaaa0002".to_string()];
            mp.mark_processed(
                0,
                Some(PlanSpec::new(
                    "refactor payments",
                    vec![
                        PlannedTask::new("t1", "one"),
                        PlannedTask::new("t2", "two").with_deps(&["t1"]),
                    ],
                )),
            );
        }
        session.ultra_plan = Some(ultra);
    }
    attached.save().unwrap();
    let in_memory = attached.detach().unwrap();

    let reattached = manager.attach(&id).unwrap();
    assert_eq!(reattached.session(), &in_memory);

    let ultra = reattached.session().ultra_plan.as_ref().unwrap();
    let mp = ultra.multi_pass_state().unwrap();
    assert!(mp.is_processed(0));
    assert_eq!(mp.candidate_plans.len(), 2);
    assert_eq!(
        mp.candidate_plans[0].as_ref().unwrap().execution_order,
        vec![vec!["t1".to_string()], vec!["t2".to_string()]]
    );
}

#[test]
fn test_second_owner_sees_holder_identity() {
    let env = TestEnv::new();
    let manager = env.manager();
    let attached = manager.create("owned", env.path()).unwrap();
    let id = attached.id().clone();

    let err = manager.attach(&id).unwrap_err();
    match &err {
        Error::AlreadyLocked { holder, .. } => {
            assert_eq!(holder.pid, current_pid());
            assert_eq!(holder.hostname, hostname());
        }
        other => panic!("expected AlreadyLocked, got {:?}", other),
    }
    assert!(err.to_string().contains(&current_pid().to_string()));
    assert!(manager.recovery().recover_session(&id).is_err());
    drop(attached);
}

#[test]
fn test_crashed_owner_is_reclaimed_without_manual_cleanup() {
    let env = TestEnv::new();
    let manager = env.manager();
    let id = manager.create("crashy", env.path()).unwrap().detach().unwrap().id;

    plant_lock(&env, &id, dead_pid());
    assert!(env.store().locks().is_locked(&id).unwrap().is_none());

    let attached = manager.attach(&id).unwrap();
    assert_eq!(attached.lock().info().pid, current_pid());
}

#[test]
fn test_recovery_sweep_then_attach() {
    let env = TestEnv::new();
    let manager = env.manager();
    let recovery: RecoveryManager = manager.recovery();

    let pid = dead_pid();
    let mut ids = Vec::new();
    for name in ["one", "two"] {
        let mut attached = manager.create(name, env.path()).unwrap();
        attached
            .session_mut()
            .add_instance(Instance::new(&Instance::generate_id(), "work"));
        attached.save().unwrap();
        let id = attached.detach().unwrap().id;
        plant_lock(&env, &id, pid);
        ids.push(id);
    }
    let live = manager.create("live", env.path()).unwrap();

    let candidates = recovery.check_for_recovery().unwrap();
    assert_eq!(candidates.len(), 2);
    assert!(candidates
        .iter()
        .all(|c| matches!(c.reason, RecoveryReason::StaleLock { pid: p, .. } if p == pid)));

    assert_eq!(recovery.cleanup_stale().unwrap(), 2);
    assert!(recovery.check_for_recovery().unwrap().is_empty());
    for id in &ids {
        recovery.validate_session(id).unwrap();
        manager.attach(id).unwrap();
    }

    let infos = env.store().list().unwrap();
    assert_eq!(infos.len(), 3);
    let live_info = infos.iter().find(|i| &i.id == live.id()).unwrap();
    assert!(live_info.is_locked());
}

#[test]
fn test_missing_and_corrupted_are_distinct() {
    let env = TestEnv::new();
    let store = env.store();

    let missing = SessionId::new();
    assert!(matches!(store.load(&missing), Err(Error::NotFound(_))));

    let id = env.manager().create("soon broken", env.path()).unwrap().detach().unwrap().id;
    fs::write(store.session_path(&id), "{\"id\": \"truncated").unwrap();
    assert!(matches!(
        store.load(&id),
        Err(Error::SessionCorrupted { .. })
    ));
    assert!(matches!(
        env.manager().attach(&id),
        Err(Error::SessionCorrupted { .. })
    ));
    // a failed attach must not leave the lock behind
    assert!(env.store().locks().read(&id).unwrap().is_none());
}

#[test]
fn test_versioned_progress_between_two_writers() {
    let env = TestEnv::new();
    let store = env.store();
    let id = env.manager().create("versioned", env.path()).unwrap().detach().unwrap().id;

    let v1 = store.save_versioned(&id, "progress", &vec![0usize], 0).unwrap();

    // both writers read v1
    let (mut first, seen_a): (Vec<usize>, u64) = store.load_versioned(&id, "progress").unwrap();
    let (mut second, seen_b): (Vec<usize>, u64) = store.load_versioned(&id, "progress").unwrap();
    assert_eq!((seen_a, seen_b), (v1, v1));

    first.push(1);
    store.save_versioned(&id, "progress", &first, seen_a).unwrap();

    second.push(2);
    assert!(matches!(
        store.save_versioned(&id, "progress", &second, seen_b),
        Err(Error::StaleData { .. })
    ));

    let (stored, version): (Vec<usize>, u64) = store.load_versioned(&id, "progress").unwrap();
    assert_eq!(stored, vec![0, 1]);
    assert_eq!(version, 2);
    // the session body is untouched by versioned writes
    assert_eq!(store.load(&id).unwrap().name, "versioned");
}

#[test]
fn test_attach_races_recovery_sweep() {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let env = TestEnv::new();
    for _ in 0..10 {
        let id = env.manager().create("contested", env.path()).unwrap().detach().unwrap().id;
        plant_lock(&env, &id, dead_pid());

        let barrier = Arc::new(Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let config = env.config.clone();
                let id = id.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let manager = claudio::SessionManager::from_config(&config);
                    barrier.wait();
                    if i % 2 == 0 {
                        manager.attach(&id).ok()
                    } else {
                        let _ = manager.recovery().cleanup_stale();
                        None
                    }
                })
            })
            .collect();
        let owners: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert!(owners.len() <= 1, "{} sessions attached at once", owners.len());
        if let Some(owner) = owners.first() {
            assert_eq!(
                env.store().locks().read(&id).unwrap().as_ref(),
                Some(owner.lock().info())
            );
        }
    }
}

#[test]
fn test_versioned_writers_racing_across_threads() {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let env = TestEnv::new();
    let id = env.manager().create("racing", env.path()).unwrap().detach().unwrap().id;
    let store = env.store();
    store.save_versioned(&id, "progress", &vec![0usize], 0).unwrap();

    let writers = 4;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let store = store.clone();
            let id = id.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.save_versioned(&id, "progress", &vec![0usize, w + 1], 1)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(Error::StaleData { .. })))
            .count(),
        writers - 1
    );
    let (stored, version): (Vec<usize>, u64) = store.load_versioned(&id, "progress").unwrap();
    assert_eq!(version, 2);
    assert_eq!(stored.len(), 2);
}
