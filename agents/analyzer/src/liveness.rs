//! Process liveness checks.

use crate::registry::ProcessId;

/// Answers whether a monitored process is still running.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: ProcessId) -> bool;
}

/// Probes with a null signal: `kill(pid, 0)` succeeds, or fails with `EPERM`,
/// exactly when the process exists.
///
/// Zombies still count as alive until their parent reaps them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl LivenessProbe for SignalProbe {
    fn is_alive(&self, pid: ProcessId) -> bool {
        // pid 0 and values beyond i32::MAX address process groups, not a process.
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        let result = unsafe { libc::kill(raw, 0) };
        result == 0 || std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
    }
}
