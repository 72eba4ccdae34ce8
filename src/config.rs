//! Configuration and on-disk layout.
//!
//! A [`Config`] is built once at the entry point and passed by reference to
//! everything that needs it. There is no process-global configuration state.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{clog_debug, Error, Result};

/// Name of the per-repository state directory.
pub const CLAUDIO_DIR: &str = ".claudio";
/// Default file a planner writes its plan to, relative to its worktree.
pub const DEFAULT_PLAN_FILE: &str = ".claudio-plan.json";
/// Default tmux session prefix for worker instances.
pub const DEFAULT_TMUX_PREFIX: &str = "claudio";

/// Strategies handed to the planners of a multi-pass run, one planner each.
pub const DEFAULT_STRATEGIES: [&str; 3] = [
    "maximize-parallelism",
    "minimize-complexity",
    "balanced-approach",
];

/// On-disk config file. Every field is optional so layers can overlay.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FileConfig {
    pub debug: Option<bool>,
    pub plan_file: Option<String>,
    pub tmux_prefix: Option<String>,
    #[serde(default)]
    pub ultraplan: UltraPlanFileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UltraPlanFileConfig {
    pub multi_pass: Option<bool>,
    pub strategies: Option<Vec<String>>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        clog_debug!("FileConfig::load path={}", path.display());
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(toml::from_str(&fs::read_to_string(path)?)?))
    }

    /// Overlay `other` on top of `self`; set fields in `other` win.
    fn merge(self, other: FileConfig) -> FileConfig {
        FileConfig {
            debug: other.debug.or(self.debug),
            plan_file: other.plan_file.or(self.plan_file),
            tmux_prefix: other.tmux_prefix.or(self.tmux_prefix),
            ultraplan: UltraPlanFileConfig {
                multi_pass: other.ultraplan.multi_pass.or(self.ultraplan.multi_pass),
                strategies: other.ultraplan.strategies.or(self.ultraplan.strategies),
            },
        }
    }
}

/// Resolved, immutable configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory that holds `.claudio/` (normally the repository root).
    pub base_dir: PathBuf,
    pub debug: bool,
    pub plan_file: String,
    pub tmux_prefix: String,
    pub multi_pass: bool,
    pub strategies: Vec<String>,
}

impl Config {
    /// Defaults rooted at `base_dir`, ignoring any config files.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            debug: false,
            plan_file: DEFAULT_PLAN_FILE.to_string(),
            tmux_prefix: DEFAULT_TMUX_PREFIX.to_string(),
            multi_pass: false,
            strategies: DEFAULT_STRATEGIES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Resolve the base directory from `start` and load both config layers.
    ///
    /// The base directory is the working tree root of the enclosing git
    /// repository, or `start` itself when it is not inside one.
    pub fn discover(start: &Path) -> Result<Self> {
        let base_dir = discover_base_dir(start)?;
        clog_debug!("Config::discover base_dir={}", base_dir.display());

        let mut layered = FileConfig::default();
        if let Some(user_path) = Self::user_config_path() {
            if let Some(user) = FileConfig::load(&user_path)? {
                layered = layered.merge(user);
            }
        }
        let repo_path = base_dir.join(CLAUDIO_DIR).join("config.toml");
        if let Some(repo) = FileConfig::load(&repo_path)? {
            layered = layered.merge(repo);
        }

        Ok(Self::with_base_dir(base_dir).apply(layered))
    }

    fn apply(mut self, file: FileConfig) -> Self {
        if let Some(debug) = file.debug {
            self.debug = debug;
        }
        if let Some(plan_file) = file.plan_file {
            self.plan_file = plan_file;
        }
        if let Some(prefix) = file.tmux_prefix {
            self.tmux_prefix = prefix;
        }
        if let Some(multi_pass) = file.ultraplan.multi_pass {
            self.multi_pass = multi_pass;
        }
        if let Some(strategies) = file.ultraplan.strategies {
            if !strategies.is_empty() {
                self.strategies = strategies;
            }
        }
        self
    }

    /// Builder-style override used by the CLI's `--debug` flag.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = self.debug || debug;
        self
    }

    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("claudio").join("config.toml"))
    }

    pub fn claudio_dir(&self) -> PathBuf {
        self.base_dir.join(CLAUDIO_DIR)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.claudio_dir().join("sessions")
    }

    pub fn log_path(&self) -> PathBuf {
        self.claudio_dir().join("claudio.log")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let sessions_dir = self.sessions_dir();
        if !sessions_dir.exists() {
            clog_debug!("Creating sessions directory: {}", sessions_dir.display());
            fs::create_dir_all(&sessions_dir)?;
        }
        Ok(())
    }
}

fn discover_base_dir(start: &Path) -> Result<PathBuf> {
    match git2::Repository::discover(start) {
        Ok(repo) => match repo.workdir() {
            Some(workdir) => Ok(workdir.to_path_buf()),
            None => Err(Error::Validation(format!(
                "Repository at {} is bare",
                repo.path().display()
            ))),
        },
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(start.to_path_buf()),
        Err(e) => Err(e.into()),
    }
}
