//! Agent error types
//!
//! Each component has its own error enum. At the orchestrator boundary they
//! are folded into [`SessionError`], whose variants are the kinds reported to
//! the coordinator and the operator.

use std::time::Duration;
use thiserror::Error;

/// Coordinator client errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Network failure, timeout, or unexpected HTTP status
    #[error("Coordinator unreachable: {0}")]
    Transport(String),

    /// Credentials rejected (HTTP 401/403)
    #[error("Coordinator rejected credentials (HTTP {status})")]
    AuthRejected { status: u16 },

    /// Response body could not be understood
    #[error("Malformed coordinator response: {0}")]
    Malformed(String),

    /// Request could not be built from local configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for CoordinatorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CoordinatorError::Malformed(e.to_string())
        } else {
            CoordinatorError::Transport(e.to_string())
        }
    }
}

/// The system random source failed; nothing can be minted safely
#[derive(Debug, Error)]
#[error("Secure random source unavailable: {0}")]
pub struct CredentialError(#[from] pub rand::Error);

/// Sync daemon errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// No daemon command configured
    #[error("Sync daemon command is empty")]
    NoCommand,

    /// Nothing to expose
    #[error("Sync session has no modules")]
    NoModules,

    /// The session already has a daemon
    #[error("Sync daemon already running for this session")]
    AlreadyRunning,

    /// The session has no daemon yet
    #[error("Sync daemon not running")]
    NotRunning,

    /// Transient configuration could not be written
    #[error("Failed to write daemon configuration: {0}")]
    Config(#[source] std::io::Error),

    /// No ephemeral port could be reserved
    #[error("Failed to reserve a loopback port: {0}")]
    Port(#[source] std::io::Error),

    /// Process could not be started
    #[error("Failed to spawn sync daemon: {0}")]
    Spawn(#[source] std::io::Error),

    /// Process exited before it started listening
    #[error("Sync daemon exited during startup ({0})")]
    ExitedEarly(String),

    /// Port never became reachable
    #[error("Sync daemon not listening on port {port} after {timeout:?}")]
    NotListening { port: u16, timeout: Duration },

    /// Shutdown failed
    #[error("Failed to stop sync daemon: {0}")]
    Stop(#[source] std::io::Error),
}

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No tunnel command configured
    #[error("Tunnel command is empty")]
    NoCommand,

    /// Transient known-hosts file could not be written
    #[error("Failed to write known hosts: {0}")]
    KnownHosts(#[source] std::io::Error),

    /// Process could not be started
    #[error("Failed to spawn tunnel: {0}")]
    Spawn(#[source] std::io::Error),

    /// Remote host could not be reached
    #[error("Storage unit unreachable: {0}")]
    Unreachable(String),

    /// Remote host rejected our key, or its host key did not match
    #[error("Storage unit authentication failed: {0}")]
    AuthFailed(String),

    /// Remote side refused to allocate the forwarded port
    #[error("Remote port allocation failed: {0}")]
    PortAllocation(String),

    /// No port allocation reported within the open timeout
    #[error("Tunnel did not report a remote port within {0:?}")]
    OpenTimeout(Duration),

    /// The session has no open tunnel
    #[error("Tunnel not open")]
    NotOpen,

    /// Session request could not be delivered over the tunnel
    #[error("Failed to send session request: {0}")]
    Request(#[source] std::io::Error),

    /// Shutdown failed
    #[error("Failed to close tunnel: {0}")]
    Close(#[source] std::io::Error),
}

impl TunnelError {
    /// Whether further sessions in this run should be skipped.
    ///
    /// An unreachable storage unit only affects its own session; a rejected
    /// key or a refused forward will not get better before the next run.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            TunnelError::AuthFailed(_) | TunnelError::PortAllocation(_)
        )
    }
}

/// Error kinds at the orchestrator boundary
#[derive(Debug, Error)]
pub enum SessionError {
    /// Coordinator or network unreachable; retried by the next scheduled run
    #[error("Transport error: {0}")]
    Transport(String),

    /// Registration or machine credentials rejected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Random source failure
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Local sync daemon failed to come up
    #[error("Sync daemon failed to start: {0}")]
    DaemonStart(#[from] DaemonError),

    /// Tunnel could not be established
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Session exceeded its maximum duration
    #[error("Session exceeded maximum duration of {0:?}")]
    Timeout(Duration),

    /// Session ended by a termination signal
    #[error("Session cancelled by signal")]
    Cancelled,

    /// Outcome could not be delivered to the coordinator
    #[error("Failed to report outcome: {0}")]
    Report(String),
}

impl From<CoordinatorError> for SessionError {
    fn from(e: CoordinatorError) -> Self {
        match &e {
            CoordinatorError::AuthRejected { .. } => SessionError::Auth(e.to_string()),
            _ => SessionError::Transport(e.to_string()),
        }
    }
}

impl SessionError {
    /// Short machine-readable kind, used in outcome reports
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Transport(_) => "transport",
            SessionError::Auth(_) => "auth",
            SessionError::Credential(_) => "credential",
            SessionError::DaemonStart(_) => "daemon-start",
            SessionError::Tunnel(_) => "tunnel",
            SessionError::Timeout(_) => "timeout",
            SessionError::Cancelled => "cancelled",
            SessionError::Report(_) => "report",
        }
    }

    /// Whether the rest of this run should be abandoned
    pub fn is_fatal_for_run(&self) -> bool {
        match self {
            SessionError::Auth(_) | SessionError::Credential(_) | SessionError::Cancelled => true,
            SessionError::Tunnel(e) => e.is_fatal_for_run(),
            _ => false,
        }
    }
}
