//! tmux-backed liveness probe for worker instances.
//!
//! Only the read side lives here: whether a worker's tmux session still
//! exists. Creating and driving sessions is done by the orchestrator above.

use std::process::Command;

use crate::process::LivenessProbe;
use crate::session::Instance;
use crate::clog_trace;

pub struct Tmux;

impl Tmux {
    pub fn session_exists(name: &str) -> bool {
        let exists = Command::new("tmux")
            .args(["has-session", "-t", &format!("={}", name)])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        clog_trace!("Tmux::session_exists name={} exists={}", name, exists);
        exists
    }

    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    /// Session name for an instance, e.g. `claudio-ab12cd34`.
    pub fn session_name(prefix: &str, instance_id: &str) -> String {
        format!("{}-{}", prefix, sanitize_session_name(instance_id))
    }
}

fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Treats an instance as live while its tmux session exists.
#[derive(Debug, Clone)]
pub struct TmuxProbe {
    prefix: String,
    available: bool,
}

impl TmuxProbe {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            available: Tmux::is_available(),
        }
    }

    fn session_for(&self, instance: &Instance) -> String {
        instance
            .tmux_session
            .clone()
            .unwrap_or_else(|| Tmux::session_name(&self.prefix, &instance.id))
    }
}

impl LivenessProbe for TmuxProbe {
    fn is_running(&self, instance: &Instance) -> bool {
        if !self.available {
            return false;
        }
        Tmux::session_exists(&self.session_for(instance))
    }
}
