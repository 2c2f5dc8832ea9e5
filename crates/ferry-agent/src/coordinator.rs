//! Coordinator (API server) client
//!
//! Every call is a JSON `POST <api_url>/<command>`. Machine credentials ride
//! in the body of each request. The check-in reply is validated defensively:
//! anything that does not look like a schedule is treated as "nothing to do"
//! rather than failing the run.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use ferry_core::{MachineId, Source, StorageUnit};

use crate::error::CoordinatorError;

/// Registration endpoint, also used to sync sources
const CMD_UPDATE_CONFIG: &str = "update_config";
/// Scheduled-work check-in
const CMD_CHECKIN: &str = "agent_ping_checkin";
/// Restore-mode source lookup
const CMD_RESTORE: &str = "agent_ping_restore";
/// Session outcome report
const CMD_REPORT: &str = "agent_ping_report";

/// Credentials presented on every call after registration
#[derive(Clone, Serialize)]
pub struct MachineAuth {
    pub uuid: MachineId,
    pub secret: String,
}

impl fmt::Debug for MachineAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineAuth")
            .field("uuid", &self.uuid)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Credentials for first registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RegistrationAuth {
    /// name/secret style
    Named { name: String, secret: String },
    /// nameless secret style
    Secret(String),
}

/// Machine description sent on registration and source sync
#[derive(Debug, Clone, Serialize)]
pub struct MachineProfile {
    pub uuid: MachineId,
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub unit_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
    pub sources: BTreeMap<String, Source>,
}

/// Work for one storage unit.
///
/// `sources` holds the coordinator's view of each scheduled source (its
/// entry minus the `storage` block), relayed untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub storage: StorageUnit,
    pub sources: BTreeMap<String, Map<String, Value>>,
}

impl Assignment {
    /// Names of the sources in this assignment
    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}

/// Answer to a check-in
#[derive(Debug, Clone, PartialEq)]
pub enum CheckIn {
    /// No work pending (the common case)
    NothingToDo,
    /// One assignment per storage unit, served one after another
    Work(Vec<Assignment>),
}

/// Final state of a session, as reported to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Timeout,
    Failed,
    Cancelled,
}

/// Outcome report for one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub storage: String,
    pub sources: Vec<String>,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub duration_secs: u64,
}

/// Operations the agent needs from the coordinator
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Register this machine; returns the identity the coordinator assigned
    async fn register(
        &self,
        auth: &RegistrationAuth,
        profile: &MachineProfile,
    ) -> Result<MachineId, CoordinatorError>;

    /// Push the current source definitions
    async fn sync_sources(&self, profile: &MachineProfile) -> Result<(), CoordinatorError>;

    /// Ask whether there is anything to do.
    ///
    /// Only sources present in `local` are considered.
    async fn check_in(
        &self,
        machine: &MachineAuth,
        local: &BTreeMap<String, Source>,
    ) -> Result<CheckIn, CoordinatorError>;

    /// Find which storage units hold this machine's sources
    async fn restore_lookup(
        &self,
        machine: &MachineAuth,
        local: &BTreeMap<String, Source>,
    ) -> Result<Vec<Assignment>, CoordinatorError>;

    /// Report a session outcome
    async fn report(
        &self,
        machine: &MachineAuth,
        report: &SessionReport,
    ) -> Result<(), CoordinatorError>;
}

/// HTTPS coordinator client
pub struct CoordinatorClient {
    /// Base URL, without trailing slash
    api_url: String,
    /// HTTP client with the per-request timeout applied
    http: reqwest::Client,
}

impl CoordinatorClient {
    /// Create a client for `api_url`
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, CoordinatorError> {
        if api_url.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest("api_url is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// POST a JSON body and parse the JSON reply
    async fn call(&self, command: &str, body: &Value) -> Result<Value, CoordinatorError> {
        let url = format!("{}/{}", self.api_url, command);
        // Bodies carry secrets; only the endpoint is logged
        tracing::debug!("API request: {}", url);

        let response = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("API response: {} {}", url, status);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CoordinatorError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(CoordinatorError::Transport(format!(
                "HTTP {} from {}",
                status, url
            )));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| CoordinatorError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn register(
        &self,
        auth: &RegistrationAuth,
        profile: &MachineProfile,
    ) -> Result<MachineId, CoordinatorError> {
        let reply = self
            .call(CMD_UPDATE_CONFIG, &json!({ "auth": auth, "machine": profile }))
            .await?;

        // The coordinator may hand back a different identity; it is authoritative
        match reply.pointer("/machine/uuid").and_then(Value::as_str) {
            Some(uuid) => MachineId::parse(uuid).map_err(|e| {
                CoordinatorError::Malformed(format!("invalid machine uuid {:?}: {}", uuid, e))
            }),
            None => Ok(profile.uuid),
        }
    }

    async fn sync_sources(&self, profile: &MachineProfile) -> Result<(), CoordinatorError> {
        self.call(CMD_UPDATE_CONFIG, &json!({ "machine": profile }))
            .await
            .map(|_| ())
    }

    async fn check_in(
        &self,
        machine: &MachineAuth,
        local: &BTreeMap<String, Source>,
    ) -> Result<CheckIn, CoordinatorError> {
        let reply = match self.call(CMD_CHECKIN, &json!({ "machine": machine })).await {
            Err(CoordinatorError::Malformed(reason)) => {
                tracing::warn!("Ignoring malformed check-in reply: {}", reason);
                return Ok(CheckIn::NothingToDo);
            }
            other => other?,
        };

        match parse_assignments(&reply, "scheduled_sources", local) {
            Ok(assignments) if assignments.is_empty() => Ok(CheckIn::NothingToDo),
            Ok(assignments) => Ok(CheckIn::Work(assignments)),
            Err(e) => {
                tracing::warn!("Ignoring malformed check-in reply: {}", e);
                Ok(CheckIn::NothingToDo)
            }
        }
    }

    async fn restore_lookup(
        &self,
        machine: &MachineAuth,
        local: &BTreeMap<String, Source>,
    ) -> Result<Vec<Assignment>, CoordinatorError> {
        let reply = self.call(CMD_RESTORE, &json!({ "machine": machine })).await?;
        parse_assignments(&reply, "sources", local)
    }

    async fn report(
        &self,
        machine: &MachineAuth,
        report: &SessionReport,
    ) -> Result<(), CoordinatorError> {
        self.call(CMD_REPORT, &json!({ "machine": machine, "report": report }))
            .await
            .map(|_| ())
    }
}

/// Group `reply.machine.<key>` by storage unit.
///
/// Entries for sources not configured locally, or without a storage block,
/// are skipped. Entries whose storage block does not parse are skipped with
/// a warning. A reply without the map at all is malformed.
pub fn parse_assignments(
    reply: &Value,
    key: &str,
    local: &BTreeMap<String, Source>,
) -> Result<Vec<Assignment>, CoordinatorError> {
    let entries = reply
        .get("machine")
        .and_then(|m| m.get(key))
        .and_then(Value::as_object)
        .ok_or_else(|| CoordinatorError::Malformed(format!("reply has no machine.{} map", key)))?;

    let mut by_storage: BTreeMap<String, Assignment> = BTreeMap::new();

    for (name, entry) in entries {
        if !local.contains_key(name) {
            tracing::debug!("Skipping source '{}': not configured locally", name);
            continue;
        }
        let Some(mut attributes) = entry.as_object().cloned() else {
            tracing::warn!("Skipping source '{}': entry is not a map", name);
            continue;
        };
        let Some(storage) = attributes.remove("storage") else {
            continue;
        };
        let storage: StorageUnit = match serde_json::from_value(storage) {
            Ok(storage) => storage,
            Err(e) => {
                tracing::warn!("Skipping source '{}': unusable storage block: {}", name, e);
                continue;
            }
        };

        by_storage
            .entry(storage.name.clone())
            .or_insert_with(|| Assignment {
                storage,
                sources: BTreeMap::new(),
            })
            .sources
            .insert(name.clone(), attributes);
    }

    Ok(by_storage.into_values().collect())
}
