//! Ping orchestrator
//!
//! One invocation of `ferry-agent ping` is one pass through this state
//! machine:
//!
//! ```text
//! Idle -> CheckingIn -> NothingToDo
//!                    -> PreparingSession -> TunnelOpen -> AwaitingCompletion -> Reporting
//!                       (any failure) ----------------------------------------> Aborted
//! ```
//!
//! Each storage unit in the assignment gets its own session, strictly one
//! after another. Teardown runs after every session regardless of how it
//! ended, and the outcome is reported on a best-effort basis. Nothing is
//! retried within a run; the next scheduled run is the retry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use ferry_core::{AccessMode, Source};

use crate::coordinator::{
    Assignment, CheckIn, Coordinator, MachineAuth, ReportStatus, SessionReport,
};
use crate::credentials::new_login;
use crate::daemon::ModuleGrant;
use crate::error::SessionError;
use crate::session::{ActiveSession, Launchers};
use crate::tunnel::PingAction;

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Idle,
    CheckingIn,
    NothingToDo,
    PreparingSession,
    TunnelOpen,
    AwaitingCompletion,
    Reporting,
    Aborted,
}

impl PingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PingState::NothingToDo | PingState::Reporting | PingState::Aborted
        )
    }
}

impl fmt::Display for PingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How one session ended
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub storage: String,
    pub sources: Vec<String>,
    pub status: ReportStatus,
    pub reason: Option<String>,
    pub remote_port: Option<u16>,
    pub duration: Duration,
}

impl SessionOutcome {
    fn to_report(&self) -> SessionReport {
        SessionReport {
            storage: self.storage.clone(),
            sources: self.sources.clone(),
            status: self.status,
            reason: self.reason.clone(),
            remote_port: self.remote_port,
            duration_secs: self.duration.as_secs(),
        }
    }
}

/// Result of a whole ping run
#[derive(Debug)]
pub struct RunSummary {
    /// Terminal state reached
    pub state: PingState,
    /// One entry per session attempted
    pub sessions: Vec<SessionOutcome>,
    /// Error that ended the run early, if any
    pub error: Option<SessionError>,
}

impl RunSummary {
    /// True when there was nothing to do or every session succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && self
                .sessions
                .iter()
                .all(|s| s.status == ReportStatus::Success)
    }
}

/// Drives one check-in run
pub struct PingOrchestrator {
    coordinator: Arc<dyn Coordinator>,
    launchers: Launchers,
    machine: MachineAuth,
    /// Locally configured sources; the only ones ever exposed
    sources: BTreeMap<String, Source>,
    /// Upper bound on a single session
    max_duration: Duration,
    state: PingState,
}

impl PingOrchestrator {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        launchers: Launchers,
        machine: MachineAuth,
        sources: BTreeMap<String, Source>,
        max_duration: Duration,
    ) -> Self {
        Self {
            coordinator,
            launchers,
            machine,
            sources,
            max_duration,
            state: PingState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> PingState {
        self.state
    }

    fn transition(&mut self, next: PingState) {
        tracing::debug!("Ping state: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run the state machine to a terminal state
    pub async fn run(&mut self, cancel: &CancellationToken) -> RunSummary {
        self.transition(PingState::CheckingIn);

        let check_in = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            reply = self.coordinator.check_in(&self.machine, &self.sources) => {
                reply.map_err(SessionError::from)
            }
        };

        let assignments = match check_in {
            Ok(CheckIn::NothingToDo) => {
                tracing::info!("Nothing to do");
                self.transition(PingState::NothingToDo);
                return RunSummary {
                    state: PingState::NothingToDo,
                    sessions: Vec::new(),
                    error: None,
                };
            }
            Ok(CheckIn::Work(assignments)) => assignments,
            Err(e) => {
                tracing::error!("Check-in failed: {}", e);
                self.transition(PingState::Aborted);
                return RunSummary {
                    state: PingState::Aborted,
                    sessions: Vec::new(),
                    error: Some(e),
                };
            }
        };

        tracing::info!("{} storage unit(s) to serve", assignments.len());

        let mut sessions = Vec::new();
        let mut aborted = false;
        let mut run_error = None;

        for assignment in assignments {
            if cancel.is_cancelled() {
                run_error = Some(SessionError::Cancelled);
                aborted = true;
                break;
            }

            let (outcome, error) = self.serve(assignment, cancel).await;
            self.report(&outcome).await;
            sessions.push(outcome);

            if let Some(error) = error {
                aborted = true;
                if error.is_fatal_for_run() {
                    tracing::error!("Abandoning remaining sessions: {}", error);
                    run_error = Some(error);
                    break;
                }
            }
        }

        let terminal = if aborted {
            PingState::Aborted
        } else {
            PingState::Reporting
        };
        self.transition(terminal);
        RunSummary {
            state: terminal,
            sessions,
            error: run_error,
        }
    }

    /// Serve one assignment. Teardown has happened by the time this returns.
    ///
    /// The error is returned when the session was aborted before reaching
    /// `AwaitingCompletion`, or when the abort should end the run.
    async fn serve(
        &mut self,
        assignment: Assignment,
        cancel: &CancellationToken,
    ) -> (SessionOutcome, Option<SessionError>) {
        let started = Instant::now();
        let storage_name = assignment.storage.name.clone();
        let source_names = assignment.source_names();
        tracing::info!(
            "Serving {} for sources: {}",
            storage_name,
            source_names.join(", ")
        );

        let mut session = ActiveSession::new(assignment.storage.clone());
        let result = self.drive(&mut session, &assignment, cancel).await;
        let remote_port = session.remote_port();
        session.teardown().await;

        let mut outcome = SessionOutcome {
            storage: storage_name,
            sources: source_names,
            status: ReportStatus::Success,
            reason: None,
            remote_port,
            duration: started.elapsed(),
        };

        match result {
            Ok(None) => {
                tracing::info!("Session with {} complete", outcome.storage);
                (outcome, None)
            }
            Ok(Some(detail)) => {
                tracing::warn!("Session with {} ended abnormally: {}", outcome.storage, detail);
                outcome.status = ReportStatus::Failed;
                outcome.reason = Some(detail);
                (outcome, None)
            }
            Err(e) => {
                tracing::error!("Session with {} aborted: {}", outcome.storage, e);
                outcome.status = match &e {
                    SessionError::Timeout(_) => ReportStatus::Timeout,
                    SessionError::Cancelled => ReportStatus::Cancelled,
                    _ => ReportStatus::Failed,
                };
                outcome.reason = Some(format!("{}: {}", e.kind(), e));
                (outcome, Some(e))
            }
        }
    }

    /// The session steps proper. `Ok(Some(detail))` means the storage unit
    /// hung up with a failure status.
    async fn drive(
        &mut self,
        session: &mut ActiveSession,
        assignment: &Assignment,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SessionError> {
        self.transition(PingState::PreparingSession);
        let modules = self.grants_for(assignment)?;
        let launchers = self.launchers.clone();
        session
            .start_daemon(launchers.daemons.as_ref(), modules, cancel)
            .await?;

        self.transition(PingState::TunnelOpen);
        session
            .open_tunnel(launchers.tunnels.as_ref(), PingAction::Checkin, cancel)
            .await?;

        self.transition(PingState::AwaitingCompletion);
        let exit = session.await_completion(self.max_duration, cancel).await?;
        Ok((!exit.success).then(|| format!("tunnel exited: {}", exit.detail)))
    }

    /// Read-only module grants, each with a fresh login
    fn grants_for(&self, assignment: &Assignment) -> Result<Vec<ModuleGrant>, SessionError> {
        let mut grants = Vec::new();
        for name in assignment.sources.keys() {
            let Some(source) = self.sources.get(name) else {
                continue;
            };
            grants.push(ModuleGrant {
                name: name.clone(),
                path: source.path.clone(),
                access: AccessMode::ReadOnly,
                login: new_login()?,
            });
        }
        Ok(grants)
    }

    async fn report(&mut self, outcome: &SessionOutcome) {
        self.transition(PingState::Reporting);
        if let Err(e) = self
            .coordinator
            .report(&self.machine, &outcome.to_report())
            .await
        {
            let e = SessionError::Report(e.to_string());
            tracing::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(PingState::NothingToDo.is_terminal());
        assert!(PingState::Reporting.is_terminal());
        assert!(PingState::Aborted.is_terminal());
        assert!(!PingState::TunnelOpen.is_terminal());
        assert!(!PingState::Idle.is_terminal());
    }

    #[test]
    fn test_summary_success() {
        let ok = SessionOutcome {
            storage: "alpha".into(),
            sources: vec!["etc".into()],
            status: ReportStatus::Success,
            reason: None,
            remote_port: Some(1),
            duration: Duration::from_secs(1),
        };
        let mut summary = RunSummary {
            state: PingState::Reporting,
            sessions: vec![ok.clone()],
            error: None,
        };
        assert!(summary.is_success());

        summary.sessions.push(SessionOutcome {
            status: ReportStatus::Timeout,
            ..ok
        });
        assert!(!summary.is_success());
    }

    #[test]
    fn test_report_payload() {
        let outcome = SessionOutcome {
            storage: "alpha".into(),
            sources: vec!["etc".into(), "home".into()],
            status: ReportStatus::Timeout,
            reason: Some("timeout: exceeded".into()),
            remote_port: Some(41000),
            duration: Duration::from_millis(2500),
        };
        let report = serde_json::to_value(outcome.to_report()).unwrap();
        assert_eq!(report["status"], "timeout");
        assert_eq!(report["duration_secs"], 2);
        assert_eq!(report["remote_port"], 41000);
    }
}
