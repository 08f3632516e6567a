//! Process-tree termination.
//!
//! Killing only the immediate child is unsound when the child forks. Every
//! spawn site places the child in its own process group so the whole
//! descendant tree is reachable via a negative-PID signal, and termination
//! goes SIGTERM, grace period, SIGKILL.

use std::time::Duration;

use tokio::process::{Child, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Killed,
}

/// Put the child in its own session so the entire process group can be
/// signalled as a tree.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn set_new_session(_cmd: &mut Command) {}

/// Signal the process group rooted at `pid`.
#[cfg(unix)]
pub fn signal_tree(pid: u32, signal: i32) -> std::io::Result<KillOutcome> {
    unsafe {
        if libc::killpg(pid as i32, signal) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(KillOutcome::NotRunning);
            }
            return Err(err);
        }
    }
    Ok(KillOutcome::Killed)
}

#[cfg(not(unix))]
pub fn signal_tree(_pid: u32, _signal: i32) -> std::io::Result<KillOutcome> {
    Ok(KillOutcome::NotRunning)
}

/// SIGKILL the tree immediately. Used when an output cap is crossed.
pub fn kill_tree_now(pid: u32) {
    #[cfg(unix)]
    let _ = signal_tree(pid, libc::SIGKILL);
    #[cfg(not(unix))]
    let _ = pid;
}

/// Graceful tree termination: SIGTERM the group, wait out the grace period,
/// then SIGKILL whatever is left. `child` is reaped with a short settle
/// window; a child that still has not exited resolves as killed anyway.
pub async fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) {
    tracing::debug!(pid, grace_ms = grace.as_millis() as u64, "terminating process tree");
    #[cfg(unix)]
    {
        let _ = signal_tree(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        let _ = signal_tree(pid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = grace;
        let _ = child.start_kill();
    }
    // settle window: reap if possible, resolve regardless
    let _ = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
}

/// RAII guard: kills the tree if the owning future is dropped before the
/// process exits. Call `disarm` after a clean wait.
pub struct ChildGuard {
    pid: Option<u32>,
}

impl ChildGuard {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    pub fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            kill_tree_now(pid);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_tree_reports_missing_group() {
        // PID far above pid_max on default systems
        let outcome = signal_tree(3_999_999, libc::SIGTERM).unwrap_or(KillOutcome::NotRunning);
        assert_eq!(outcome, KillOutcome::NotRunning);
    }

    #[tokio::test]
    async fn terminate_tree_kills_a_sleeping_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        set_new_session(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        let start = std::time::Instant::now();
        terminate_tree(&mut child, pid, Duration::from_millis(200)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        // the group is gone
        assert_eq!(
            signal_tree(pid, 0).unwrap_or(KillOutcome::NotRunning),
            KillOutcome::NotRunning
        );
    }
}
