//! One sync session: a daemon plus the tunnel exposing it
//!
//! [`ActiveSession`] owns both child handles. Whatever happens while it is
//! being built or awaited, [`ActiveSession::teardown`] closes the tunnel
//! first and then stops the daemon. The ping orchestrator and the restore
//! controller both drive sessions through this type.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ferry_core::StorageUnit;

use crate::daemon::{DaemonHandle, DaemonLauncher, ModuleGrant};
use crate::error::{DaemonError, SessionError, TunnelError};
use crate::tunnel::{PingAction, PingRequest, TunnelExit, TunnelHandle, TunnelLauncher};

/// The two launchers a session needs
#[derive(Clone)]
pub struct Launchers {
    pub daemons: Arc<dyn DaemonLauncher>,
    pub tunnels: Arc<dyn TunnelLauncher>,
}

/// A session under construction or running
pub struct ActiveSession {
    storage: StorageUnit,
    daemon: Option<Box<dyn DaemonHandle>>,
    tunnel: Option<Box<dyn TunnelHandle>>,
}

impl ActiveSession {
    /// An empty session bound for `storage`
    pub fn new(storage: StorageUnit) -> Self {
        Self {
            storage,
            daemon: None,
            tunnel: None,
        }
    }

    pub fn storage(&self) -> &StorageUnit {
        &self.storage
    }

    /// Modules of the running daemon
    pub fn modules(&self) -> &[ModuleGrant] {
        self.daemon.as_ref().map(|d| d.modules()).unwrap_or(&[])
    }

    /// Remote port, once the tunnel is open
    pub fn remote_port(&self) -> Option<u16> {
        self.tunnel.as_ref().map(|t| t.remote_port())
    }

    /// Start the daemon and wait for it to listen
    pub async fn start_daemon(
        &mut self,
        launcher: &dyn DaemonLauncher,
        modules: Vec<ModuleGrant>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        if self.daemon.is_some() {
            return Err(DaemonError::AlreadyRunning.into());
        }
        let daemon = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            started = launcher.start(modules) => started?,
        };
        self.daemon = Some(daemon);
        Ok(())
    }

    /// Open the tunnel to the daemon and send the session request.
    ///
    /// Returns the remote port. Requires a running daemon.
    pub async fn open_tunnel(
        &mut self,
        launcher: &dyn TunnelLauncher,
        action: PingAction,
        cancel: &CancellationToken,
    ) -> Result<u16, SessionError> {
        let Some(daemon) = self.daemon.as_ref() else {
            return Err(DaemonError::NotRunning.into());
        };
        let address = daemon.address().to_string();
        let port = daemon.port();

        let tunnel = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            opened = launcher.open(&self.storage, &address, port) => opened?,
        };
        let remote_port = tunnel.remote_port();
        let tunnel = self.tunnel.insert(tunnel);

        let request = PingRequest::new(action, remote_port, daemon.modules());
        tunnel.send_request(&request).await?;
        Ok(remote_port)
    }

    /// Wait for the storage unit to hang up, bounded by `max_duration`
    pub async fn await_completion(
        &mut self,
        max_duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<TunnelExit, SessionError> {
        let Some(tunnel) = self.tunnel.as_mut() else {
            return Err(TunnelError::NotOpen.into());
        };
        tokio::select! {
            exited = tunnel.wait() => Ok(exited?),
            _ = tokio::time::sleep(max_duration) => Err(SessionError::Timeout(max_duration)),
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        }
    }

    /// Close the tunnel, then stop the daemon. Never fails; errors are
    /// logged. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            if let Err(e) = tunnel.close().await {
                tracing::warn!("Closing tunnel to {}: {}", self.storage.name, e);
            }
        }
        if let Some(mut daemon) = self.daemon.take() {
            if let Err(e) = daemon.stop().await {
                tracing::warn!("Stopping sync daemon: {}", e);
            }
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        // The handles' own drop kills their processes; this only flags the bug
        if self.tunnel.is_some() || self.daemon.is_some() {
            tracing::warn!(
                "Session for {} dropped without teardown; killing its processes",
                self.storage.name
            );
        }
    }
}
