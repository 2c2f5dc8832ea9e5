//! Restore controller
//!
//! Skips the scheduled check-in: asks the coordinator which storage units
//! hold this machine's sources, then for each selected unit starts a
//! writable session rooted at the restore destination and prints what an
//! operator on the storage unit needs to push files back. The session stays
//! up until the operator stops the agent, the storage side hangs up, or the
//! restore time limit runs out.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use ferry_core::{AccessMode, Source};

use crate::coordinator::{Assignment, Coordinator, MachineAuth};
use crate::credentials::new_login;
use crate::daemon::ModuleGrant;
use crate::error::SessionError;
use crate::session::{ActiveSession, Launchers};
use crate::tunnel::PingAction;

/// Where storage units keep per-machine data
const STORAGE_MACHINES_DIR: &str = "/var/lib/ferry-storage/machines";

/// Restore failures
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("No configured sources are held by any storage unit")]
    NoSources,

    #[error("Storage unit '{0}' does not hold any of this machine's sources")]
    UnknownStorage(String),

    #[error("Failed to prepare restore destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write restore instructions: {0}")]
    Output(#[from] std::io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Names shown to the operator
#[derive(Debug, Clone, Default)]
pub struct MachineLabels {
    pub environment_name: Option<String>,
    pub service_name: Option<String>,
    pub unit_name: Option<String>,
}

/// Restore-side settings
#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// Local directory the storage unit writes into
    pub destination: PathBuf,
    /// Name of the writable module
    pub module: String,
    /// Upper bound on one restore session
    pub max_duration: Duration,
}

/// One restore session as presented to the operator
#[derive(Debug, Clone)]
pub struct RestoreSession {
    pub storage: String,
    pub remote_port: u16,
    pub username: String,
}

/// Runs restore mode
pub struct RestoreController {
    coordinator: Arc<dyn Coordinator>,
    launchers: Launchers,
    machine: MachineAuth,
    labels: MachineLabels,
    sources: BTreeMap<String, Source>,
    settings: RestoreSettings,
}

impl RestoreController {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        launchers: Launchers,
        machine: MachineAuth,
        labels: MachineLabels,
        sources: BTreeMap<String, Source>,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            coordinator,
            launchers,
            machine,
            labels,
            sources,
            settings,
        }
    }

    /// Serve restore sessions, writing operator output to `out`.
    ///
    /// With `selected`, only that storage unit is served; otherwise every
    /// unit holding sources is served in turn. A cancellation ends the run
    /// normally.
    pub async fn run<W: Write>(
        &self,
        selected: Option<&str>,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<Vec<RestoreSession>, RestoreError> {
        let assignments = self
            .coordinator
            .restore_lookup(&self.machine, &self.sources)
            .await
            .map_err(SessionError::from)?;
        if assignments.is_empty() {
            return Err(RestoreError::NoSources);
        }

        writeln!(out, "This machine's sources are on the following storage units:")?;
        for assignment in &assignments {
            writeln!(out, "    {}", assignment.storage.name)?;
            for name in assignment.sources.keys() {
                writeln!(out, "        {}", name)?;
            }
        }
        writeln!(out)?;

        let assignments: Vec<Assignment> = match selected {
            Some(name) => {
                let chosen: Vec<Assignment> = assignments
                    .into_iter()
                    .filter(|a| a.storage.name == name)
                    .collect();
                if chosen.is_empty() {
                    return Err(RestoreError::UnknownStorage(name.to_string()));
                }
                chosen
            }
            None => assignments,
        };

        tokio::fs::create_dir_all(&self.settings.destination)
            .await
            .map_err(|source| RestoreError::Destination {
                path: self.settings.destination.clone(),
                source,
            })?;

        let mut served = Vec::new();
        for assignment in assignments {
            if cancel.is_cancelled() {
                break;
            }
            let mut session = ActiveSession::new(assignment.storage.clone());
            let result = self.serve(&mut session, out, cancel).await;
            session.teardown().await;

            match result {
                Ok((restore, ended_by_operator)) => {
                    served.push(restore);
                    if ended_by_operator {
                        tracing::info!(
                            "Restore session with {} ended by operator",
                            assignment.storage.name
                        );
                        break;
                    }
                }
                Err(RestoreError::Session(SessionError::Cancelled)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(served)
    }

    async fn serve<W: Write>(
        &self,
        session: &mut ActiveSession,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<(RestoreSession, bool), RestoreError> {
        let grant = ModuleGrant {
            name: self.settings.module.clone(),
            path: self.settings.destination.clone(),
            access: AccessMode::Writable,
            login: new_login().map_err(SessionError::from)?,
        };

        session
            .start_daemon(self.launchers.daemons.as_ref(), vec![grant.clone()], cancel)
            .await?;
        let remote_port = session
            .open_tunnel(self.launchers.tunnels.as_ref(), PingAction::Restore, cancel)
            .await?;

        self.write_block(out, &session.storage().name, remote_port, &grant)?;
        out.flush()?;

        let ended_by_operator = match session
            .await_completion(self.settings.max_duration, cancel)
            .await
        {
            Ok(exit) => {
                tracing::info!("Storage unit closed restore session ({})", exit.detail);
                false
            }
            Err(SessionError::Cancelled) => true,
            Err(e) => return Err(e.into()),
        };

        let restore = RestoreSession {
            storage: session.storage().name.clone(),
            remote_port,
            username: grant.login.username,
        };
        Ok((restore, ended_by_operator))
    }

    /// Operator instructions for one session
    fn write_block<W: Write>(
        &self,
        out: &mut W,
        storage: &str,
        remote_port: u16,
        grant: &ModuleGrant,
    ) -> std::io::Result<()> {
        let uuid = &self.machine.uuid;
        writeln!(out, "Machine UUID: {}", uuid)?;
        if let Some(name) = &self.labels.environment_name {
            writeln!(out, "Machine environment: {}", name)?;
        }
        if let Some(name) = &self.labels.service_name {
            writeln!(out, "Machine service: {}", name)?;
        }
        if let Some(name) = &self.labels.unit_name {
            writeln!(out, "Machine unit: {}", name)?;
        }
        writeln!(out, "Storage unit: {}", storage)?;
        writeln!(out, "Local destination path: {}", grant.path.display())?;
        writeln!(out, "Module: {}", grant.name)?;
        writeln!(out, "Remote port: {}", remote_port)?;
        writeln!(out, "Username: {}", grant.login.username)?;
        writeln!(out, "Credential: {}", grant.login.password.expose())?;
        writeln!(out, "Sample restore usage from storage unit:")?;
        writeln!(out, "    cd {}/{}/", STORAGE_MACHINES_DIR, uuid)?;
        writeln!(
            out,
            "    RSYNC_PASSWORD={} rsync -avzP --numeric-ids ${{P?}}/ rsync://{}@127.0.0.1:{}/{}/",
            grant.login.password.expose(),
            grant.login.username,
            remote_port,
            grant.name
        )?;
        writeln!(out)
    }
}
