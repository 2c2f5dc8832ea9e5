//! Reverse tunnel to a storage unit

mod ssh;

pub use ssh::{classify_failure, parse_allocated_port, SshTunnelManager, SshTunnelSession, TunnelSettings};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use ferry_core::StorageUnit;

use crate::credentials::ModuleLogin;
use crate::daemon::ModuleGrant;
use crate::error::TunnelError;

/// Terminator the storage side reads up to
const REQUEST_TERMINATOR: &str = "\n.\n";

/// What the storage unit is being asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    /// Pull the listed sources
    Checkin,
    /// Idle; an operator drives the transfer
    Restore,
}

impl PingAction {
    fn as_str(&self) -> &'static str {
        match self {
            PingAction::Checkin => "checkin",
            PingAction::Restore => "restore",
        }
    }
}

/// Session request written to the storage unit once the tunnel is up
#[derive(Debug, Clone)]
pub struct PingRequest {
    pub action: PingAction,
    /// Remote end of the forward
    pub port: u16,
    /// Login per source module
    pub sources: BTreeMap<String, ModuleLogin>,
}

impl PingRequest {
    /// Build a request for the read-only modules of a session.
    ///
    /// Writable modules are never announced; restores are operator driven.
    pub fn new(action: PingAction, port: u16, modules: &[ModuleGrant]) -> Self {
        let sources = match action {
            PingAction::Checkin => modules
                .iter()
                .filter(|m| m.access.read_only())
                .map(|m| (m.name.clone(), m.login.clone()))
                .collect(),
            PingAction::Restore => BTreeMap::new(),
        };
        Self { action, port, sources }
    }

    /// JSON document as sent to the storage side
    pub fn to_json(&self) -> Value {
        let sources: serde_json::Map<String, Value> = self
            .sources
            .iter()
            .map(|(name, login)| {
                (
                    name.clone(),
                    json!({ "username": login.username, "password": login.password.expose() }),
                )
            })
            .collect();
        json!({
            "verbose": true,
            "action": self.action.as_str(),
            "port": self.port,
            "sources": sources,
        })
    }

    /// Wire form: JSON followed by the terminator line
    pub fn to_wire(&self) -> String {
        format!("{}{}", self.to_json(), REQUEST_TERMINATOR)
    }
}

/// How the tunnel process ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelExit {
    pub success: bool,
    pub detail: String,
}

/// Opens reverse tunnels
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Connect to `storage` and forward a remote port back to
    /// `local_address:local_port`. Returns once the remote port is known.
    async fn open(
        &self,
        storage: &StorageUnit,
        local_address: &str,
        local_port: u16,
    ) -> Result<Box<dyn TunnelHandle>, TunnelError>;
}

/// A live reverse tunnel (one `TunnelSession`)
#[async_trait]
pub trait TunnelHandle: Send {
    /// Port allocated on the storage unit
    fn remote_port(&self) -> u16;

    /// Deliver the session request to the storage side
    async fn send_request(&mut self, request: &PingRequest) -> Result<(), TunnelError>;

    /// Wait for the tunnel to end on its own (the storage unit hung up).
    /// Cancel safe.
    async fn wait(&mut self) -> Result<TunnelExit, TunnelError>;

    /// Tear the tunnel down. A no-op when already closed or dead.
    async fn close(&mut self) -> Result<(), TunnelError>;
}
