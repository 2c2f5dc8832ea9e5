//! OpenSSH reverse tunnel
//!
//! Runs the system `ssh` client with `-R 0:...` so the storage unit picks
//! the remote port, and learns that port from the `Allocated port` notice ssh
//! prints on stderr. Host keys come from the coordinator and are pinned
//! through a throwaway known-hosts file.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};

use ferry_core::config::AgentConfig;
use ferry_core::StorageUnit;

use super::{PingRequest, TunnelExit, TunnelHandle, TunnelLauncher};
use crate::daemon::forward_output;
use crate::error::TunnelError;
use crate::process::ManagedChild;

/// Stderr lines kept for classifying a failed connection
const MAX_DIAGNOSTIC_LINES: usize = 20;

/// Settings for [`SshTunnelManager`]
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Program and leading arguments
    pub command: Vec<String>,
    /// Private key presented to the storage unit
    pub private_key: PathBuf,
    /// Command run on the storage unit
    pub remote_command: String,
    /// How long to wait for the remote port allocation
    pub open_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub terminate_grace: Duration,
}

impl TunnelSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            command: config.ssh_command.clone(),
            private_key: config.ssh_private_key_file(),
            remote_command: config.storage_remote_command.clone(),
            open_timeout: config.tunnel_open_timeout,
            terminate_grace: config.terminate_grace,
        }
    }
}

/// Opens tunnels with the system ssh client
pub struct SshTunnelManager {
    settings: TunnelSettings,
}

impl SshTunnelManager {
    pub fn new(settings: TunnelSettings) -> Self {
        Self { settings }
    }

    fn build_command(
        &self,
        storage: &StorageUnit,
        known_hosts: &std::path::Path,
        local_address: &str,
        local_port: u16,
    ) -> Result<Command, TunnelError> {
        let (program, leading_args) = self
            .settings
            .command
            .split_first()
            .ok_or(TunnelError::NoCommand)?;

        let mut command = Command::new(program);
        command
            .args(leading_args)
            .arg("-T")
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("UserKnownHostsFile={}", known_hosts.display()))
            .args(["-o", "StrictHostKeyChecking=yes"])
            .args(["-o", "CheckHostIP=no"])
            .args(["-o", "ExitOnForwardFailure=yes"])
            .arg("-i")
            .arg(&self.settings.private_key)
            .arg("-R")
            .arg(format!("0:{}:{}", local_address, local_port))
            .arg("-p")
            .arg(storage.ssh_ping_port.to_string())
            .arg("-l")
            .arg(&storage.ssh_ping_user)
            .arg(&storage.ssh_ping_host)
            .arg(&self.settings.remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(command)
    }
}

#[async_trait]
impl TunnelLauncher for SshTunnelManager {
    async fn open(
        &self,
        storage: &StorageUnit,
        local_address: &str,
        local_port: u16,
    ) -> Result<Box<dyn TunnelHandle>, TunnelError> {
        let known_hosts = write_known_hosts(storage).map_err(TunnelError::KnownHosts)?;
        let mut command =
            self.build_command(storage, known_hosts.path(), local_address, local_port)?;
        tracing::debug!("Executing: {:?}", command.as_std());

        let mut child = ManagedChild::spawn("ssh", &mut command, self.settings.terminate_grace)
            .map_err(TunnelError::Spawn)?;

        let (stdin, stderr) = match child.child_mut() {
            Some(inner) => {
                if let Some(stdout) = inner.stdout.take() {
                    forward_output("ssh", stdout);
                }
                (inner.stdin.take(), inner.stderr.take())
            }
            None => (None, None),
        };
        let Some(stderr) = stderr else {
            let _ = child.terminate().await;
            return Err(TunnelError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "ssh stderr not captured",
            )));
        };

        let mut lines = BufReader::new(stderr).lines();
        let mut diagnostics: Vec<String> = Vec::new();

        let waited = tokio::time::timeout(self.settings.open_timeout, async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(port) = parse_allocated_port(&line) {
                            return Some(port);
                        }
                        tracing::debug!("ssh: {}", line);
                        if diagnostics.len() == MAX_DIAGNOSTIC_LINES {
                            diagnostics.remove(0);
                        }
                        diagnostics.push(line);
                    }
                    // ssh closed stderr: it is exiting
                    Ok(None) | Err(_) => return None,
                }
            }
        })
        .await;

        let remote_port = match waited {
            Ok(Some(port)) => port,
            Ok(None) => {
                let status = child.terminate().await.ok().flatten();
                let mut detail = diagnostics.join("\n");
                if let Some(status) = status {
                    if detail.is_empty() {
                        detail = format!("ssh {}", status);
                    }
                }
                return Err(classify_failure(&detail));
            }
            Err(_) => {
                let _ = child.terminate().await;
                return Err(TunnelError::OpenTimeout(self.settings.open_timeout));
            }
        };

        // Keep draining stderr so ssh never blocks on a full pipe
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("ssh: {}", line);
            }
        });

        tracing::info!(
            "Tunnel to {} open: remote port {} -> {}:{}",
            storage.name,
            remote_port,
            local_address,
            local_port
        );

        Ok(Box::new(SshTunnelSession {
            remote_port,
            child,
            stdin,
            known_hosts: Some(known_hosts),
        }))
    }
}

/// A running ssh tunnel
pub struct SshTunnelSession {
    remote_port: u16,
    child: ManagedChild,
    stdin: Option<ChildStdin>,
    known_hosts: Option<tempfile::NamedTempFile>,
}

#[async_trait]
impl TunnelHandle for SshTunnelSession {
    fn remote_port(&self) -> u16 {
        self.remote_port
    }

    async fn send_request(&mut self, request: &PingRequest) -> Result<(), TunnelError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            TunnelError::Request(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel input already closed",
            ))
        })?;
        stdin
            .write_all(request.to_wire().as_bytes())
            .await
            .map_err(TunnelError::Request)?;
        stdin.flush().await.map_err(TunnelError::Request)
    }

    async fn wait(&mut self) -> Result<TunnelExit, TunnelError> {
        let status = self.child.wait().await.map_err(TunnelError::Close)?;
        Ok(TunnelExit {
            success: status.success(),
            detail: status.to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), TunnelError> {
        self.stdin.take();
        let result = self.child.terminate().await.map(|_| ());
        if let Some(file) = self.known_hosts.take() {
            if let Err(e) = file.close() {
                tracing::warn!("Failed to remove known hosts file: {}", e);
            }
        }
        result.map_err(TunnelError::Close)
    }
}

/// Write the pinned host keys in known-hosts format
fn write_known_hosts(storage: &StorageUnit) -> std::io::Result<tempfile::NamedTempFile> {
    let host = if storage.ssh_ping_port == 22 {
        storage.ssh_ping_host.clone()
    } else {
        format!("[{}]:{}", storage.ssh_ping_host, storage.ssh_ping_port)
    };

    let mut file = tempfile::Builder::new()
        .prefix("ferry-known-hosts-")
        .tempfile()?;
    for key in &storage.ssh_ping_host_keys {
        writeln!(file, "{} {}", host, key)?;
    }
    file.flush()?;
    Ok(file)
}

/// Extract the port from ssh's `Allocated port N for remote forward to ...`
pub fn parse_allocated_port(line: &str) -> Option<u16> {
    line.trim()
        .strip_prefix("Allocated port ")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
        .filter(|port| *port != 0)
}

/// Map ssh's diagnostics for a failed connection onto an error kind
pub fn classify_failure(detail: &str) -> TunnelError {
    let detail = detail.trim().to_string();
    if detail.contains("Permission denied") || detail.contains("Host key verification failed") {
        TunnelError::AuthFailed(detail)
    } else if detail.contains("remote port forwarding failed") {
        TunnelError::PortAllocation(detail)
    } else {
        TunnelError::Unreachable(detail)
    }
}
