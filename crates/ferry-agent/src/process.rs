//! Supervised child processes
//!
//! The sync daemon and the tunnel are both long-lived children owned by a
//! [`ManagedChild`]. Termination is SIGTERM, a bounded grace period, then
//! SIGKILL, and is idempotent. As a backstop the child is killed when the
//! handle is dropped, and on Linux it also receives SIGTERM if the agent
//! itself dies.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};

/// An owned child process with guaranteed teardown
#[derive(Debug)]
pub struct ManagedChild {
    /// Short label used in logs
    name: &'static str,
    /// Live child, `None` once reaped
    child: Option<Child>,
    /// Exit status once reaped
    status: Option<ExitStatus>,
    /// Time allowed between SIGTERM and SIGKILL
    grace: Duration,
}

impl ManagedChild {
    /// Spawn `command` under supervision
    pub fn spawn(name: &'static str, command: &mut Command, grace: Duration) -> io::Result<Self> {
        command.kill_on_drop(true);

        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        tracing::debug!("Spawned {} (pid {:?})", name, child.id());
        Ok(Self {
            name,
            child: Some(child),
            status: None,
            grace,
        })
    }

    /// Process ID, while the child has not been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Mutable access to the live child (for taking its pipes)
    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Exit status, if the child has already exited
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(child) = self.child.as_mut() {
            if let Some(status) = child.try_wait()? {
                self.reap(status);
            }
        }
        Ok(self.status)
    }

    /// Wait for the child to exit on its own
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(child) = self.child.as_mut() {
            let status = child.wait().await?;
            self.reap(status);
        }
        self.status
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child was never started"))
    }

    /// Stop the child. Safe to call any number of times.
    pub async fn terminate(&mut self) -> io::Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(self.status);
        };

        if let Some(status) = child.try_wait()? {
            self.reap(status);
            return Ok(self.status);
        }

        if let Some(pid) = child.id() {
            send_sigterm(pid);
        }

        let status = match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    "{} did not exit within {:?} of SIGTERM, killing",
                    self.name,
                    self.grace
                );
                child.kill().await?;
                child.wait().await?
            }
        };

        self.reap(status);
        Ok(self.status)
    }

    fn reap(&mut self, status: ExitStatus) {
        tracing::debug!("{} exited: {}", self.name, status);
        self.child = None;
        self.status = Some(status);
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminate_running_child() {
        let mut child =
            ManagedChild::spawn("sleeper", Command::new("sleep").arg("30"), Duration::from_secs(2))
                .unwrap();
        let pid = child.id().unwrap();

        let status = child.terminate().await.unwrap();
        assert!(status.is_some());
        assert!(child.id().is_none());
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut child =
            ManagedChild::spawn("sleeper", Command::new("sleep").arg("30"), Duration::from_secs(2))
                .unwrap();
        let first = child.terminate().await.unwrap();
        let second = child.terminate().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_falls_back_to_kill() {
        let mut child = ManagedChild::spawn(
            "stubborn",
            Command::new("sh").args(["-c", "trap '' TERM; sleep 30"]),
            Duration::from_millis(200),
        )
        .unwrap();
        // Give the shell a moment to install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = child.terminate().await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_wait_and_try_status() {
        let mut child =
            ManagedChild::spawn("true", &mut Command::new("true"), Duration::from_secs(1)).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(child.try_status().unwrap(), Some(status));
        // Terminating an exited child is a no-op
        assert_eq!(child.terminate().await.unwrap(), Some(status));
    }

    fn process_exists(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
}
