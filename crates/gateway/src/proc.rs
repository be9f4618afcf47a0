//! Subprocess signalling shared by the supervisor and sessions.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::time::Instant;

const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn terminate(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
}

pub(crate) fn force_kill(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

pub(crate) fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Poll until the process is gone (reaped by its wait task) or the timeout
/// elapses. Returns true when the process is gone.
pub(crate) async fn wait_until_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !is_alive(pid)
}

/// SIGTERM, bounded wait, then SIGKILL with a short reap window.
pub(crate) async fn terminate_and_reap(pid: i32) {
    terminate(pid);
    if wait_until_gone(pid, GRACEFUL_STOP_TIMEOUT).await {
        return;
    }
    tracing::warn!(pid, "process did not stop gracefully, killing");
    force_kill(pid);
    wait_until_gone(pid, KILL_REAP_TIMEOUT).await;
}
