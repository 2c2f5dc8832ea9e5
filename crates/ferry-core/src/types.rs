//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identity the coordinator knows this machine by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub Uuid);

impl MachineId {
    /// Mint a fresh random identity (used before first registration)
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identity from its hyphenated string form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One thing to back up.
///
/// Only `path` is interpreted locally. Every other attribute (frequency,
/// retention, exclusions, ...) belongs to the coordinator and is carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Local directory exposed to the storage unit
    pub path: PathBuf,

    /// Opaque attributes relayed verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Source {
    /// Create a source with no extra attributes
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// Build a source from an untyped attribute map.
    ///
    /// Returns `None` when `path` is missing or not a string.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) if map.get("path").map_or(false, |p| p.is_string()) => {
                serde_json::from_value(serde_json::Value::Object(map)).ok()
            }
            _ => None,
        }
    }
}

/// A storage unit as described by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnit {
    /// Storage unit name (also the grouping key for assignments)
    pub name: String,
    /// SSH host the tunnel connects to
    pub ssh_ping_host: String,
    /// SSH port
    pub ssh_ping_port: u16,
    /// SSH login user
    pub ssh_ping_user: String,
    /// Accepted host public keys (`<type> <base64>` lines)
    #[serde(default)]
    pub ssh_ping_host_keys: Vec<String>,
}

/// Access granted to the storage unit through the sync daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    /// Storage unit pulls from the agent (backups)
    ReadOnly,
    /// Storage unit pushes to the agent (restores only)
    Writable,
}

impl AccessMode {
    /// Value of the daemon's `read only` module option
    pub fn read_only(&self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::Writable => write!(f, "writable"),
        }
    }
}
