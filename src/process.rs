//! Host-local process liveness.
//!
//! Liveness is decided by the OS process table of this host only. A pid
//! recorded on another host cannot be probed from here.

use crate::session::Instance;

/// Answers whether the execution surface backing an instance is still running.
pub trait LivenessProbe {
    fn is_running(&self, instance: &Instance) -> bool;
}

/// Probes the instance's recorded pid with signal 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_running(&self, instance: &Instance) -> bool {
        instance.pid.is_some_and(is_process_alive)
    }
}

/// Name of this host, as recorded in lock files.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Some(name) = name.to_str() {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Pid of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Signal-0 existence check. EPERM means the process exists but belongs to
/// someone else, which still counts as alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    pid == current_pid()
}
