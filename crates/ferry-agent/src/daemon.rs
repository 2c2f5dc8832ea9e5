//! Ephemeral rsync daemon
//!
//! A session's daemon lives in its own private temporary directory holding
//! `rsyncd.conf` and `rsyncd.secrets`. It listens on a loopback address only,
//! on a port the OS picked, and is torn down together with that directory.

use std::fmt::Write as _;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;

use ferry_core::config::AgentConfig;
use ferry_core::AccessMode;

use crate::credentials::ModuleLogin;
use crate::error::DaemonError;
use crate::process::ManagedChild;

/// Interval between listening checks during startup
const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One module exposed by a session's daemon
#[derive(Debug, Clone)]
pub struct ModuleGrant {
    /// Module name as seen by the connecting client
    pub name: String,
    /// Directory served
    pub path: PathBuf,
    /// Read-only for backups, writable for restores
    pub access: AccessMode,
    /// Login that may use this module, valid for this session only
    pub login: ModuleLogin,
}

/// Starts sync daemons
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Start a daemon exposing `modules` and wait until it is listening
    async fn start(&self, modules: Vec<ModuleGrant>) -> Result<Box<dyn DaemonHandle>, DaemonError>;
}

/// A running sync daemon (one `SyncSession`)
#[async_trait]
pub trait DaemonHandle: Send {
    /// Loopback address the daemon is bound to
    fn address(&self) -> &str;

    /// Port the daemon is listening on
    fn port(&self) -> u16;

    /// Modules exposed by this daemon
    fn modules(&self) -> &[ModuleGrant];

    /// Stop the daemon and remove its configuration. Idempotent.
    async fn stop(&mut self) -> Result<(), DaemonError>;
}

/// Settings for [`RsyncDaemonManager`]
#[derive(Debug, Clone)]
pub struct RsyncSettings {
    /// Program and leading arguments
    pub command: Vec<String>,
    /// `uid` for the daemon; omitted when empty
    pub user: String,
    /// `gid` for the daemon; omitted when empty
    pub group: String,
    /// Loopback address to bind
    pub address: String,
    /// How long to wait for the port to accept connections
    pub start_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub terminate_grace: Duration,
}

impl RsyncSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            command: config.rsyncd_command.clone(),
            user: config.rsyncd_user.clone(),
            group: config.rsyncd_group.clone(),
            address: config.rsyncd_local_address.clone(),
            start_timeout: config.daemon_start_timeout,
            terminate_grace: config.terminate_grace,
        }
    }
}

/// Launches `rsync --daemon` for each session
pub struct RsyncDaemonManager {
    settings: RsyncSettings,
}

impl RsyncDaemonManager {
    pub fn new(settings: RsyncSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl DaemonLauncher for RsyncDaemonManager {
    async fn start(&self, modules: Vec<ModuleGrant>) -> Result<Box<dyn DaemonHandle>, DaemonError> {
        let settings = &self.settings;
        let (program, leading_args) = settings
            .command
            .split_first()
            .ok_or(DaemonError::NoCommand)?;
        if modules.is_empty() {
            return Err(DaemonError::NoModules);
        }

        let port = reserve_port(&settings.address).map_err(DaemonError::Port)?;

        let dir = tempfile::Builder::new()
            .prefix("ferry-rsyncd-")
            .tempdir()
            .map_err(DaemonError::Config)?;
        let conf_path = dir.path().join("rsyncd.conf");
        let secrets_path = dir.path().join("rsyncd.secrets");

        write_private(&secrets_path, &render_secrets(&modules)).map_err(DaemonError::Config)?;
        write_private(
            &conf_path,
            &render_config(settings, port, &modules, &secrets_path),
        )
        .map_err(DaemonError::Config)?;

        let mut command = Command::new(program);
        command
            .args(leading_args)
            .arg("--no-detach")
            .arg("--daemon")
            .arg(format!("--config={}", conf_path.display()))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        tracing::debug!("Executing: {:?}", command.as_std());

        let mut child = ManagedChild::spawn("rsyncd", &mut command, settings.terminate_grace)
            .map_err(DaemonError::Spawn)?;
        if let Some(inner) = child.child_mut() {
            if let Some(stdout) = inner.stdout.take() {
                forward_output("rsyncd", stdout);
            }
            if let Some(stderr) = inner.stderr.take() {
                forward_output("rsyncd", stderr);
            }
        }

        let mut session = RsyncSession {
            address: settings.address.clone(),
            port,
            modules,
            child,
            dir: Some(dir),
        };

        if let Err(e) = session.wait_listening(settings.start_timeout).await {
            // Partial start: the teardown path is the same as a normal stop
            if let Err(stop_err) = session.stop().await {
                tracing::warn!("Cleanup after failed daemon start: {}", stop_err);
            }
            return Err(e);
        }

        tracing::info!(
            "Sync daemon listening on {}:{} ({} module(s))",
            session.address,
            session.port,
            session.modules.len()
        );
        Ok(Box::new(session))
    }
}

/// A live rsync daemon and its transient files
pub struct RsyncSession {
    address: String,
    port: u16,
    modules: Vec<ModuleGrant>,
    child: ManagedChild,
    /// Removed on stop
    dir: Option<tempfile::TempDir>,
}

impl RsyncSession {
    async fn wait_listening(&mut self, timeout: Duration) -> Result<(), DaemonError> {
        let started = Instant::now();
        loop {
            if let Some(status) = self.child.try_status().map_err(DaemonError::Spawn)? {
                return Err(DaemonError::ExitedEarly(status.to_string()));
            }
            if TcpStream::connect((self.address.as_str(), self.port)).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(DaemonError::NotListening {
                    port: self.port,
                    timeout,
                });
            }
            tokio::time::sleep(LISTEN_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl DaemonHandle for RsyncSession {
    fn address(&self) -> &str {
        &self.address
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn modules(&self) -> &[ModuleGrant] {
        &self.modules
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        let result = self.child.terminate().await.map(|_| ());
        // The secrets go away even if the process could not be reaped
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove daemon configuration: {}", e);
            }
        }
        result.map_err(DaemonError::Stop)
    }
}

/// Pick a free port on `address` by binding to port 0.
///
/// The listener is dropped before the daemon binds; the window is small and a
/// collision surfaces as a start failure.
pub fn reserve_port(address: &str) -> std::io::Result<u16> {
    let listener = TcpListener::bind((address, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Render `rsyncd.conf`
pub fn render_config(
    settings: &RsyncSettings,
    port: u16,
    modules: &[ModuleGrant],
    secrets_path: &Path,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "address = {}", settings.address);
    let _ = writeln!(out, "port = {}", port);
    let _ = writeln!(out, "log file = /dev/stdout");
    if !settings.user.is_empty() {
        let _ = writeln!(out, "uid = {}", settings.user);
    }
    if !settings.group.is_empty() {
        let _ = writeln!(out, "gid = {}", settings.group);
    }
    let _ = writeln!(out, "list = false");
    out.push('\n');

    for module in modules {
        let _ = writeln!(out, "[{}]", module.name);
        let _ = writeln!(out, "    path = {}", module.path.display());
        let _ = writeln!(out, "    auth users = {}", module.login.username);
        let _ = writeln!(out, "    secrets file = {}", secrets_path.display());
        let _ = writeln!(out, "    read only = {}", module.access.read_only());
        out.push('\n');
    }
    out
}

/// Render `rsyncd.secrets`, one `user:password` per module
pub fn render_secrets(modules: &[ModuleGrant]) -> String {
    modules
        .iter()
        .map(|m| format!("{}:{}\n", m.login.username, m.login.password.expose()))
        .collect()
}

/// Write a file readable only by the owner
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}

/// Relay a child's output into the log
pub(crate) fn forward_output<R>(name: &'static str, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("{}: {}", name, line);
        }
    });
}
