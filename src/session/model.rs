//! Persisted session data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use super::group::{prune_groups, InstanceGroup};
use crate::ultraplan::UltraPlanSession;
use crate::{Error, Result};

const MAX_SESSION_NAME_LENGTH: usize = 64;
const MAX_SESSION_ID_LENGTH: usize = 128;

/// Storage key of a session: the name of its directory under `sessions/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept an externally supplied id, rejecting anything that is not a
    /// single safe path component.
    pub fn parse(s: &str) -> Result<Self> {
        validate_session_id(s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Pending,
    Working,
    WaitingInput,
    Paused,
    Completed,
    Error,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Error)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Working => write!(f, "working"),
            InstanceStatus::WaitingInput => write!(f, "waiting_input"),
            InstanceStatus::Paused => write!(f, "paused"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Error => write!(f, "error"),
        }
    }
}

/// One worker process operating in its own worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub worktree_path: PathBuf,
    #[serde(default)]
    pub status: InstanceStatus,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Conversation id of the agent, used to reattach after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
}

impl Instance {
    pub fn new(id: &str, task: &str) -> Self {
        Self {
            id: id.to_string(),
            task: task.to_string(),
            branch: String::new(),
            worktree_path: PathBuf::new(),
            status: InstanceStatus::Pending,
            created: Utc::now(),
            tmux_session: None,
            pid: None,
            claude_session_id: None,
            files_modified: Vec::new(),
        }
    }

    /// Short random id in the style used for worker branches and tmux names.
    pub fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()[..8].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub base_repo: PathBuf,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<InstanceGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ultra_plan: Option<UltraPlanSession>,
}

impl Session {
    pub fn new(name: &str, base_repo: impl Into<PathBuf>) -> Result<Self> {
        validate_session_name(name)?;
        Ok(Self {
            id: SessionId::new(),
            name: name.to_string(),
            base_repo: base_repo.into(),
            created: Utc::now(),
            instances: Vec::new(),
            groups: Vec::new(),
            ultra_plan: None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_session_name(&self.name)?;
        validate_session_id(self.id.as_str())
    }

    pub fn find_instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn find_instance_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    pub fn add_instance(&mut self, instance: Instance) {
        self.instances.push(instance);
    }

    pub fn remove_instance(&mut self, id: &str) -> Option<Instance> {
        self.instances
            .iter()
            .position(|i| i.id == id)
            .map(|pos| self.instances.remove(pos))
    }

    /// Replace `groups` with a pruned copy that only references instances
    /// this session still owns. Returns true when anything was dropped.
    pub fn prune_groups(&mut self) -> bool {
        let known: HashSet<&str> = self.instances.iter().map(|i| i.id.as_str()).collect();
        let pruned = prune_groups(&self.groups, &known);
        let changed = pruned != self.groups;
        self.groups = pruned;
        changed
    }
}

fn validate_session_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Session name cannot be empty".to_string()));
    }

    if name.chars().count() > MAX_SESSION_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "Session name too long (max {} characters)",
            MAX_SESSION_NAME_LENGTH
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(
            "Session name cannot contain control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LENGTH
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid session id: {:?}", id)))
    }
}
