//! Terminate a process together with all of its descendants.
//!
//! Jobs are spawned as leaders of their own process group, so on POSIX the
//! whole tree (the crawler, its browser, the browser's driver) is reached
//! with a single group signal. On Windows the tree is walked by `taskkill /T`.

use tracing::{debug, warn};

/// How hard to ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// SIGTERM / `taskkill /T`. The tree gets a chance to clean up.
    Graceful,
    /// SIGKILL / `taskkill /T /F`.
    Force,
}

/// Signal the process tree rooted at `pid`.
///
/// `pid` must be a process group leader. Only the group is signalled, never
/// the bare pid: once the group is empty the pid may belong to an unrelated
/// process.
///
/// Returns `true` if anything was signalled, `false` when the tree is
/// already gone. Never blocks waiting for the tree to exit.
#[cfg(unix)]
pub fn terminate_tree(pid: u32, mode: TerminateMode) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match mode {
        TerminateMode::Graceful => Signal::SIGTERM,
        TerminateMode::Force => Signal::SIGKILL,
    };
    let target = Pid::from_raw(pid as i32);

    match killpg(target, signal) {
        Ok(()) => {
            debug!(pid, ?signal, "signalled process group");
            true
        }
        Err(Errno::ESRCH) => {
            debug!(pid, "process group already gone");
            false
        }
        Err(e) => {
            warn!(pid, error = %e, "failed to signal process group");
            false
        }
    }
}

#[cfg(windows)]
pub fn terminate_tree(pid: u32, mode: TerminateMode) -> bool {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.arg("/T");
    if mode == TerminateMode::Force {
        cmd.arg("/F");
    }
    cmd.arg("/PID").arg(pid.to_string());

    match cmd.output() {
        Ok(out) if out.status.success() => {
            debug!(pid, ?mode, "taskkill succeeded");
            true
        }
        Ok(out) => {
            debug!(pid, ?mode, stderr = %String::from_utf8_lossy(&out.stderr), "taskkill reported failure");
            false
        }
        Err(e) => {
            warn!(pid, error = %e, "failed to run taskkill");
            false
        }
    }
}

/// Whether any member of the tree rooted at `pid` is still alive.
#[cfg(unix)]
pub fn tree_alive(pid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(windows)]
pub fn tree_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    /// Alive and not a zombie.
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map(|state| state != "Z" && state != "X")
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_terminate_kills_descendants() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & echo $!; wait")
            .stdout(std::process::Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().trim().parse().unwrap();
        assert!(tree_alive(pid));
        assert!(running(grandchild));

        assert!(terminate_tree(pid, TerminateMode::Force));
        child.wait().await.unwrap();

        let mut gone = false;
        for _ in 0..50 {
            if !running(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "descendant survived SIGKILL of its group");
    }

    #[tokio::test]
    async fn test_only_process_groups_are_signalled() {
        // Shares the test's process group, so its pid names no group.
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        assert!(!terminate_tree(pid, TerminateMode::Force));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(running(pid));

        child.kill().await.unwrap();
    }

    #[test]
    fn test_terminate_missing_pid() {
        // Above the kernel pid_max ceiling.
        assert!(!terminate_tree(2_000_000_000, TerminateMode::Graceful));
    }
}
