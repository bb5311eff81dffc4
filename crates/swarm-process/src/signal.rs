//! Signal delivery and existence checks.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use swarm_common::{ProcessError, ProcessResult};
use tracing::debug;

/// Send `signal` to `pid`.
///
/// A pid that no longer exists counts as success: it is already
/// terminated. Pids `<= 0` address process groups and are refused.
pub fn signal_pid(pid: Pid, signal: Signal) -> ProcessResult<()> {
    if pid.as_raw() <= 0 {
        return Err(ProcessError::signal_failed(
            pid.as_raw(),
            signal.as_str(),
            "refusing to signal a process group",
        ));
    }
    match kill(pid, signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("{} not delivered to {}: no such process", signal, pid);
            Ok(())
        }
        Err(e) => Err(ProcessError::signal_failed(
            pid.as_raw(),
            signal.as_str(),
            e.to_string(),
        )),
    }
}

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`: no signal is sent. A zombie still exists until it
/// is reaped.
///
/// * `Ok(true)` - Process exists (possibly owned by someone else)
/// * `Ok(false)` - Process does not exist
/// * `Err(_)` - Error occurred while checking
pub fn process_exists(pid: Pid) -> ProcessResult<bool> {
    if pid.as_raw() <= 0 {
        return Ok(false);
    }
    match kill(pid, None) {
        Ok(_) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => Ok(true),
        Err(e) => Err(ProcessError::not_reapable(
            pid.as_raw(),
            format!("Failed to check process: {}", e),
        )),
    }
}
