//! Plan files through parsing, validation and ordering.

use claudio::plan::{
    parse_plan_text, require_valid, validate_plan, FilePlanParser, PlanGraph, PlanParser,
    Severity,
};
use claudio::Error;

use crate::fixtures::{diamond_plan_json, TestEnv};

fn ids(layers: &[Vec<String>]) -> Vec<Vec<&str>> {
    layers
        .iter()
        .map(|l| l.iter().map(String::as_str).collect())
        .collect()
}

#[test]
fn test_fan_out_orders_into_two_groups() {
    let plan = parse_plan_text(
        r#"{"tasks": [
            {"id": "A", "title": "A", "description": "a", "files": ["a"], "depends_on": []},
            {"id": "B", "title": "B", "description": "b", "files": ["b"], "depends_on": ["A"]},
            {"id": "C", "title": "C", "description": "c", "files": ["c"], "depends_on": ["A"]}
        ]}"#,
        "objective",
    )
    .unwrap();

    assert_eq!(ids(&plan.execution_order), vec![vec!["A"], vec!["B", "C"]]);
    let result = validate_plan(&plan);
    assert!(result.valid);
    assert_eq!(result.error_count, 0);
}

#[test]
fn test_mutual_dependency_is_an_invalid_cycle() {
    let plan = parse_plan_text(
        r#"{"tasks": [
            {"id": "A", "title": "A", "description": "a", "files": ["a"], "depends_on": ["B"]},
            {"id": "B", "title": "B", "description": "b", "files": ["b"], "depends_on": ["A"]}
        ]}"#,
        "objective",
    )
    .unwrap();

    let result = validate_plan(&plan);
    assert!(!result.valid);
    let cycle = result
        .errors()
        .find(|m| m.message.contains("cycle"))
        .expect("cycle error");
    assert!(cycle.related_task_ids.contains(&"A".to_string()));
    assert!(cycle.related_task_ids.contains(&"B".to_string()));

    assert!(matches!(require_valid(&plan), Err(Error::ValidationFailed(_))));
}

#[test]
fn test_planner_artifact_from_worktree() {
    let env = TestEnv::new();
    let planner = env.planner("p1", Some(&format!("```json\n{}\n```", diamond_plan_json("fenced"))));

    let plan = FilePlanParser::from_config(&env.config)
        .parse_plan(&planner.worktree_path, "ship the feature")
        .unwrap();
    assert_eq!(plan.objective, "ship the feature");
    assert_eq!(plan.summary, "fenced");
    assert_eq!(ids(&plan.execution_order), vec![vec!["setup"], vec!["api", "ui"]]);
    assert_eq!(plan.dependency_graph["ui"], vec!["setup".to_string()]);

    let result = require_valid(&plan).unwrap();
    assert_eq!(result.warning_count, 0);
}

#[test]
fn test_wrapped_plan_with_mixed_findings() {
    let env = TestEnv::new();
    let path = env.write_file(
        "plan.json",
        r#"{"plan": {
            "objective": "ops",
            "tasks": [
                {"id": "base", "title": "Base", "description": "d", "files": ["lib.rs"]},
                {"id": "x", "title": "X", "description": "d", "files": ["lib.rs", "x.rs"], "depends": ["base"]},
                {"id": "y", "title": "Y", "description": "d", "files": ["lib.rs"], "depends": ["base"], "complexity": "high"},
                {"id": "z", "title": "Z", "description": "d", "files": ["z.rs"], "depends": ["nope"]}
            ]
        }}"#,
    );
    let text = std::fs::read_to_string(path).unwrap();
    let plan = parse_plan_text(&text, "ignored").unwrap();
    assert_eq!(plan.objective, "ops");

    let result = validate_plan(&plan);
    assert!(!result.valid);
    assert_eq!(result.error_count, 1);
    // lib.rs shared by x and y in the second group
    assert_eq!(result.warning_count, 1);
    assert_eq!(result.info_count, 1);
    assert!(result
        .by_severity(Severity::Info)
        .all(|m| m.task_id.as_deref() == Some("y")));
}

#[test]
fn test_layers_respect_every_dependency() {
    let plan = parse_plan_text(
        r#"{"tasks": [
            {"id": "t5", "depends_on": ["t4", "t1"]},
            {"id": "t1"},
            {"id": "t3", "depends_on": ["t2"]},
            {"id": "t2", "depends_on": ["t1"]},
            {"id": "t4", "depends_on": ["t3", "t2"]},
            {"id": "t6"}
        ]}"#,
        "",
    )
    .unwrap();

    let graph = PlanGraph::build(&plan.tasks);
    let layering = graph.execution_layers();
    assert!(layering.unscheduled.is_empty());
    let layer_of = PlanGraph::layer_of(&layering);
    assert_eq!(layer_of.len(), plan.tasks.len());
    for task in &plan.tasks {
        for dep in &task.depends_on {
            assert!(layer_of[dep.as_str()] < layer_of[task.id.as_str()]);
        }
    }
    assert_eq!(ids(&layering.layers)[0], vec!["t1", "t6"]);
}
