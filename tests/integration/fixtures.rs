//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scratch repository directory with a claudio config
//! - Dead pids for stale-lock scenarios
//! - Planner worktrees with plan artifacts
//! - A recording planning launcher

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use claudio::config::{Config, DEFAULT_PLAN_FILE};
use claudio::plan::PlanSpec;
use claudio::session::{Instance, SessionManager, SessionStore};
use claudio::ultraplan::PlanningLauncher;
use claudio::Result;

/// A scratch base directory laid out like a repository using claudio.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = Config::with_base_dir(temp_dir.path());
        config.ensure_dirs().expect("Failed to create .claudio dirs");
        Self { temp_dir, config }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::from_config(&self.config)
    }

    pub fn manager(&self) -> SessionManager {
        SessionManager::from_config(&self.config)
    }

    /// Create a worktree directory for a planner and return an instance
    /// pointing at it. `artifact` is written as the plan file when given.
    pub fn planner(&self, id: &str, artifact: Option<&str>) -> Instance {
        let worktree = self.path().join("worktrees").join(id);
        fs::create_dir_all(&worktree).expect("Failed to create worktree");
        if let Some(text) = artifact {
            fs::write(worktree.join(DEFAULT_PLAN_FILE), text).expect("Failed to write plan");
        }
        let mut instance = Instance::new(id, "plan the objective");
        instance.branch = format!("claudio/{}", id);
        instance.worktree_path = worktree;
        instance
    }

    pub fn write_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, contents).expect("Failed to write file");
        path
    }
}

/// Pid of a process that has already exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("Failed to spawn");
    let pid = child.id();
    child.wait().expect("Failed to wait");
    pid
}

/// A three-task plan: `setup` first, then `api` and `ui` in parallel.
pub fn diamond_plan_json(summary: &str) -> String {
    serde_json::json!({
        "summary": summary,
        "tasks": [
            {"id": "setup", "title": "Setup", "description": "Scaffold", "files": ["Cargo.toml"]},
            {"id": "api", "title": "API", "description": "Endpoints", "files": ["src/api.rs"], "depends_on": ["setup"]},
            {"id": "ui", "title": "UI", "description": "Screens", "files": ["src/ui.rs"], "depends": ["setup"], "complexity": "low"}
        ]
    })
    .to_string()
}

/// Launcher that hands out fixed ids and records what it was asked to do.
#[derive(Default)]
pub struct RecordingLauncher {
    pub planner_ids: Vec<String>,
    pub planner_calls: Vec<Vec<String>>,
    pub evaluator_calls: Vec<Vec<PlanSpec>>,
}

impl RecordingLauncher {
    pub fn with_planners(ids: &[&str]) -> Self {
        Self {
            planner_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

impl PlanningLauncher for RecordingLauncher {
    fn start_planners(&mut self, _objective: &str, strategies: &[String]) -> Result<Vec<String>> {
        self.planner_calls.push(strategies.to_vec());
        Ok(self.planner_ids.clone())
    }

    fn start_coordinator(&mut self, _objective: &str) -> Result<String> {
        Ok("coordinator".to_string())
    }

    fn start_plan_manager(&mut self, _objective: &str, candidates: &[PlanSpec]) -> Result<String> {
        self.evaluator_calls.push(candidates.to_vec());
        Ok(format!("evaluator-{}", self.evaluator_calls.len()))
    }
}
