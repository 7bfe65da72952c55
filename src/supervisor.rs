//! Running a command (typically a browser driver) behind the bridge.

use std::io;
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Variables pointed at the bridge in the child's environment. Overwriting
/// them also keeps upstream credentials out of the child.
pub const CHILD_PROXY_VARS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];
const CHILD_REMOVED_VARS: [&str; 2] = ["ALL_PROXY", "all_proxy"];

/// A child process that is killed on every exit path that does not wait
/// for it: drop, early return, or cancellation of [`ChildGuard::wait`].
pub struct ChildGuard {
    program: String,
    child: Option<Child>,
}

impl ChildGuard {
    pub fn spawn(program: &str, args: &[String], proxy_url: &str) -> io::Result<Self> {
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        for var in CHILD_PROXY_VARS {
            command.env(var, proxy_url);
        }
        for var in CHILD_REMOVED_VARS {
            command.env_remove(var);
        }

        let child = command.spawn()?;
        info!(program, pid = ?child.id(), proxy = proxy_url, "started child process");
        Ok(Self {
            program: program.to_string(),
            child: Some(child),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Wait for the child to exit.
    pub async fn wait(mut self) -> io::Result<ExitStatus> {
        let Some(child) = self.child.take() else {
            return Err(io::Error::new(io::ErrorKind::Other, "child already reaped"));
        };
        let program = self.program.clone();
        let mut child = scopeguard::guard(child, move |mut child| {
            if let Err(e) = child.start_kill() {
                debug!(program = %program, error = %e, "child already gone");
            }
        });
        let status = child.wait().await?;
        info!(program = %self.program, %status, "child process exited");
        Ok(status)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!(program = %self.program, "terminating child process");
            let _ = child.start_kill();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> (String, Vec<String>) {
        ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_exit_status_is_reported() {
        let (program, args) = sh("exit 3");
        let guard = ChildGuard::spawn(&program, &args, "http://127.0.0.1:9").unwrap();
        let status = guard.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_child_sees_bridge_as_proxy() {
        let (program, args) = sh(
            r#"test "$HTTPS_PROXY" = "http://127.0.0.1:9" && test "$http_proxy" = "http://127.0.0.1:9" && test -z "$ALL_PROXY""#,
        );
        let guard = ChildGuard::spawn(&program, &args, "http://127.0.0.1:9").unwrap();
        assert!(guard.wait().await.unwrap().success());
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => false,
            // zombies are dead, just not yet reaped
            Ok(stat) => !stat.contains(") Z "),
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_dead(pid: u32) -> bool {
        for _ in 0..100 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_kills_child() {
        let (program, args) = sh("sleep 30");
        let guard = ChildGuard::spawn(&program, &args, "http://127.0.0.1:9").unwrap();
        let pid = guard.id().unwrap();
        assert!(process_alive(pid));
        drop(guard);
        assert!(wait_until_dead(pid).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancelled_wait_kills_child() {
        let (program, args) = sh("sleep 30");
        let guard = ChildGuard::spawn(&program, &args, "http://127.0.0.1:9").unwrap();
        let pid = guard.id().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), guard.wait()).await;
        assert!(waited.is_err());
        assert!(wait_until_dead(pid).await);
    }
}
