//! Agent configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::{MachineId, Source};

/// A helper program given either as a single command line or as an argv list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgramSpec {
    /// Whitespace-separated command line
    Line(String),
    /// Program first, arguments after
    Argv(Vec<String>),
}

impl ProgramSpec {
    /// Split into program and arguments. Empty when nothing is configured.
    pub fn argv(&self) -> Vec<String> {
        match self {
            ProgramSpec::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            ProgramSpec::Argv(argv) => argv.clone(),
        }
    }
}

/// Configuration for the agent, merged from all config layers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory the operator config was loaded from
    #[serde(skip)]
    pub config_dir: PathBuf,

    /// Agent-owned state directory (identity, SSH key)
    pub var_dir: PathBuf,

    /// Lock directory override (auto-detected when unset)
    pub lock_dir: Option<PathBuf>,

    /// Coordinator base URL
    pub api_url: Option<String>,

    /// Registration secret ("nameless" style)
    pub api_auth: Option<String>,

    /// Registration name (name/secret style)
    pub api_auth_name: Option<String>,

    /// Registration secret (name/secret style)
    pub api_auth_secret: Option<String>,

    /// Machine identity, written by registration
    pub machine_uuid: Option<MachineId>,

    /// Machine secret, written by registration
    pub machine_secret: Option<String>,

    /// Descriptive names relayed to the coordinator
    pub environment_name: Option<String>,
    pub service_name: Option<String>,
    pub unit_name: Option<String>,

    /// Whether the machine is published on the coordinator
    pub published: Option<bool>,

    /// Sync daemon invocation (program first)
    pub rsyncd_command: Vec<String>,

    /// User the daemon drops to for file access
    pub rsyncd_user: String,

    /// Group the daemon drops to ("*" lets recent rsync pick the user's group)
    pub rsyncd_group: String,

    /// Loopback address the daemon binds to
    pub rsyncd_local_address: String,

    /// Tunnel invocation (program first)
    pub ssh_command: Vec<String>,

    /// Key type generated at registration
    pub ssh_key_type: String,

    /// Command run on the storage unit at the far end of the tunnel
    pub storage_remote_command: String,

    /// Go/no-go program consulted before each check-in
    pub gonogo_program: Option<ProgramSpec>,

    /// Local destination for restores
    pub restore_path: PathBuf,

    /// Module name exposed in restore mode
    pub restore_module: String,

    /// Per-request coordinator timeout
    #[serde(with = "duration_secs")]
    pub api_timeout: Duration,

    /// How long the sync daemon has to start listening
    #[serde(with = "duration_secs")]
    pub daemon_start_timeout: Duration,

    /// How long ssh has to report the remote port allocation
    #[serde(with = "duration_secs")]
    pub tunnel_open_timeout: Duration,

    /// Upper bound for a check-in driven session
    #[serde(with = "duration_secs")]
    pub session_max_duration: Duration,

    /// Upper bound for an operator driven restore session
    #[serde(with = "duration_secs")]
    pub restore_max_duration: Duration,

    /// Time a child gets to exit after SIGTERM before it is killed
    #[serde(with = "duration_secs")]
    pub terminate_grace: Duration,

    /// Sources from `sources.d`
    pub sources: BTreeMap<String, Source>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_dir: super::default_config_dir(),
            var_dir: PathBuf::from(super::DEFAULT_VAR_DIR),
            lock_dir: None,
            api_url: None,
            api_auth: None,
            api_auth_name: None,
            api_auth_secret: None,
            machine_uuid: None,
            machine_secret: None,
            environment_name: None,
            service_name: None,
            unit_name: None,
            published: None,
            rsyncd_command: vec!["rsync".to_string()],
            rsyncd_user: "root".to_string(),
            rsyncd_group: "*".to_string(),
            rsyncd_local_address: "127.0.0.1".to_string(),
            ssh_command: vec!["ssh".to_string()],
            ssh_key_type: "ed25519".to_string(),
            storage_remote_command: "ferry-storage-ping".to_string(),
            gonogo_program: None,
            restore_path: PathBuf::from("/var/backups/ferry-agent/restore"),
            restore_module: "ferry-restore".to_string(),
            api_timeout: Duration::from_secs(5),
            daemon_start_timeout: Duration::from_secs(10),
            tunnel_open_timeout: Duration::from_secs(30),
            session_max_duration: Duration::from_secs(6 * 3600),
            restore_max_duration: Duration::from_secs(24 * 3600),
            terminate_grace: Duration::from_secs(5),
            sources: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    /// Unit name, falling back to the hostname
    pub fn unit_name(&self) -> String {
        self.unit_name
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// Path of the agent's SSH private key
    pub fn ssh_private_key_file(&self) -> PathBuf {
        self.var_dir.join("ssh_key")
    }

    /// Path of the agent's SSH public key
    pub fn ssh_public_key_file(&self) -> PathBuf {
        self.var_dir.join("ssh_key.pub")
    }

    /// Read the SSH public key, if one has been generated
    pub fn ssh_public_key(&self) -> Option<String> {
        std::fs::read_to_string(self.ssh_public_key_file())
            .ok()
            .map(|key| key.trim_end().to_string())
    }

    /// Machine identity and secret, when both are present
    pub fn machine_credentials(&self) -> Option<(MachineId, &str)> {
        match (&self.machine_uuid, &self.machine_secret) {
            (Some(id), Some(secret)) => Some((*id, secret.as_str())),
            _ => None,
        }
    }

    /// Whether everything a check-in needs is configured.
    ///
    /// An unregistered machine is not an error: the periodic run simply has
    /// nothing to do yet.
    pub fn is_registered(&self) -> bool {
        self.api_url.is_some()
            && self.machine_credentials().is_some()
            && self.ssh_private_key_file().is_file()
    }
}
