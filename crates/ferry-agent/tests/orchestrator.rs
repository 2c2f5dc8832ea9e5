//! Ping orchestrator integration tests
//!
//! Drives full check-in runs against in-process fakes and checks which
//! processes were started, in what order they were torn down, and what was
//! reported.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::*;
use ferry_agent::coordinator::ReportStatus;
use ferry_agent::{PingOrchestrator, PingState};
use ferry_core::AccessMode;

const SIX_HOURS: Duration = Duration::from_secs(6 * 3600);

struct Harness {
    journal: Arc<Journal>,
    daemons: Arc<FakeDaemons>,
    tunnels: Arc<FakeTunnels>,
    coordinator: Arc<FakeCoordinator>,
}

impl Harness {
    fn new(reply: CheckInReply, behavior: TunnelBehavior) -> Self {
        let journal = Arc::new(Journal::default());
        Self {
            daemons: Arc::new(FakeDaemons::new(Arc::clone(&journal))),
            tunnels: Arc::new(FakeTunnels::new(Arc::clone(&journal), behavior)),
            coordinator: Arc::new(FakeCoordinator::new(reply)),
            journal,
        }
    }

    fn orchestrator(&self, sources: &[&str]) -> PingOrchestrator {
        PingOrchestrator::new(
            Arc::clone(&self.coordinator) as Arc<dyn ferry_agent::Coordinator>,
            launchers(&self.daemons, &self.tunnels),
            machine(),
            local_sources(sources),
            SIX_HOURS,
        )
    }

    fn assert_nothing_leaked(&self) {
        let events = self.journal.events();
        assert!(
            !events.iter().any(|e| e.ends_with("leaked")),
            "leaked: {:?}",
            events
        );
        assert_eq!(
            self.journal.count("daemon.start"),
            self.journal.count("daemon.stop"),
            "{:?}",
            events
        );
        assert_eq!(
            self.journal.count("tunnel.open"),
            self.journal.count("tunnel.close"),
            "{:?}",
            events
        );
    }
}

#[tokio::test]
async fn test_nothing_to_do_starts_nothing() {
    let h = Harness::new(CheckInReply::Work(vec![]), TunnelBehavior::Completes);
    let mut orchestrator = h.orchestrator(&["etc"]);

    let summary = orchestrator.run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::NothingToDo);
    assert!(summary.is_success());
    assert!(h.journal.events().is_empty());
    assert!(h.coordinator.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_successful_session_tears_down_tunnel_first() {
    let h = Harness::new(
        CheckInReply::Work(vec![assignment("alpha", &["etc", "home"])]),
        TunnelBehavior::Completes,
    );
    let mut orchestrator = h.orchestrator(&["etc", "home"]);

    let summary = orchestrator.run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::Reporting);
    assert_eq!(orchestrator.state(), PingState::Reporting);
    assert!(summary.is_success());
    assert_eq!(
        h.journal.events(),
        vec![
            "daemon.start 40000",
            "tunnel.open alpha 127.0.0.1:40000 -> 50000",
            "tunnel.request",
            "tunnel.close 50000",
            "daemon.stop 40000",
        ]
    );

    let reports = h.coordinator.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ReportStatus::Success);
    assert_eq!(reports[0].storage, "alpha");
    assert_eq!(reports[0].sources, vec!["etc", "home"]);
    assert_eq!(reports[0].remote_port, Some(50000));
}

#[tokio::test]
async fn test_modules_are_read_only_and_use_local_paths() {
    let h = Harness::new(
        CheckInReply::Work(vec![assignment("alpha", &["etc"])]),
        TunnelBehavior::Completes,
    );
    h.orchestrator(&["etc"]).run(&CancellationToken::new()).await;

    let started = h.daemons.started.lock().unwrap();
    let grants = &started[0];
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].name, "etc");
    assert_eq!(grants[0].access, AccessMode::ReadOnly);
    // The coordinator said /etc; the local config wins
    assert_eq!(grants[0].path, std::path::PathBuf::from("/srv/etc"));

    let requests = h.tunnels.requests.lock().unwrap();
    assert_eq!(requests[0]["action"], "checkin");
    assert_eq!(requests[0]["port"], 50000);
    assert_eq!(
        requests[0]["sources"]["etc"]["username"],
        grants[0].login.username.as_str()
    );
    assert_eq!(
        requests[0]["sources"]["etc"]["password"],
        grants[0].login.password.expose()
    );
}

#[tokio::test]
async fn test_storage_units_served_one_at_a_time_with_fresh_credentials() {
    let h = Harness::new(
        CheckInReply::Work(vec![
            assignment("alpha", &["etc"]),
            assignment("beta", &["home"]),
        ]),
        TunnelBehavior::Completes,
    );
    let summary = h.orchestrator(&["etc", "home"]).run(&CancellationToken::new()).await;

    assert!(summary.is_success());
    assert_eq!(summary.sessions.len(), 2);
    // Each session is fully torn down before the next one starts
    assert_eq!(
        h.journal.events(),
        vec![
            "daemon.start 40000",
            "tunnel.open alpha 127.0.0.1:40000 -> 50000",
            "tunnel.request",
            "tunnel.close 50000",
            "daemon.stop 40000",
            "daemon.start 40001",
            "tunnel.open beta 127.0.0.1:40001 -> 50001",
            "tunnel.request",
            "tunnel.close 50001",
            "daemon.stop 40001",
        ]
    );

    let started = h.daemons.started.lock().unwrap();
    assert_ne!(started[0][0].login.password, started[1][0].login.password);
    assert_ne!(started[0][0].login.username, started[1][0].login.username);
}

#[tokio::test]
async fn test_unreachable_storage_stops_daemon_and_continues() {
    let h = Harness::new(
        CheckInReply::Work(vec![
            assignment("alpha", &["etc"]),
            assignment("beta", &["home"]),
        ]),
        TunnelBehavior::Unreachable,
    );
    let summary = h.orchestrator(&["etc", "home"]).run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::Aborted);
    assert!(!summary.is_success());
    assert!(summary.error.is_none());
    // Both units were tried
    assert_eq!(*h.tunnels.opened.lock().unwrap(), vec!["alpha", "beta"]);
    assert_eq!(h.journal.count("daemon.stop"), 2);
    h.assert_nothing_leaked();

    let reports = h.coordinator.reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.status == ReportStatus::Failed));
    assert!(reports[0].reason.as_deref().unwrap().starts_with("tunnel:"));
}

#[tokio::test]
async fn test_tunnel_auth_failure_ends_run() {
    let h = Harness::new(
        CheckInReply::Work(vec![
            assignment("alpha", &["etc"]),
            assignment("beta", &["home"]),
        ]),
        TunnelBehavior::AuthFails,
    );
    let summary = h.orchestrator(&["etc", "home"]).run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::Aborted);
    assert_eq!(summary.error.as_ref().map(|e| e.kind()), Some("tunnel"));
    assert_eq!(*h.tunnels.opened.lock().unwrap(), vec!["alpha"]);
    assert_eq!(summary.sessions.len(), 1);
    h.assert_nothing_leaked();
}

#[tokio::test]
async fn test_daemon_failure_skips_tunnel() {
    let journal = Arc::new(Journal::default());
    let h = Harness {
        daemons: Arc::new(FakeDaemons::failing(Arc::clone(&journal))),
        tunnels: Arc::new(FakeTunnels::new(Arc::clone(&journal), TunnelBehavior::Completes)),
        coordinator: Arc::new(FakeCoordinator::new(CheckInReply::Work(vec![assignment(
            "alpha",
            &["etc"],
        )]))),
        journal,
    };
    let summary = h.orchestrator(&["etc"]).run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::Aborted);
    assert_eq!(h.journal.events(), vec!["daemon.fail"]);
    assert!(h.tunnels.opened.lock().unwrap().is_empty());

    let reports = h.coordinator.reports.lock().unwrap();
    assert!(reports[0].reason.as_deref().unwrap().starts_with("daemon-start:"));
}

#[tokio::test(start_paused = true)]
async fn test_session_timeout_is_reported_and_torn_down() {
    let h = Harness::new(
        CheckInReply::Work(vec![assignment("alpha", &["etc"])]),
        TunnelBehavior::Hangs,
    );
    let summary = h.orchestrator(&["etc"]).run(&CancellationToken::new()).await;

    assert!(!summary.is_success());
    assert_eq!(summary.sessions[0].status, ReportStatus::Timeout);
    assert_eq!(
        h.coordinator.reports.lock().unwrap()[0].status,
        ReportStatus::Timeout
    );
    assert_eq!(h.journal.count("tunnel.close"), 1);
    assert_eq!(h.journal.count("daemon.stop"), 1);
    h.assert_nothing_leaked();
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_tears_down_session() {
    let h = Harness::new(
        CheckInReply::Work(vec![
            assignment("alpha", &["etc"]),
            assignment("beta", &["home"]),
        ]),
        TunnelBehavior::Hangs,
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let summary = h.orchestrator(&["etc", "home"]).run(&cancel).await;

    assert_eq!(summary.state, PingState::Aborted);
    assert_eq!(summary.error.as_ref().map(|e| e.kind()), Some("cancelled"));
    assert_eq!(summary.sessions.len(), 1);
    assert_eq!(summary.sessions[0].status, ReportStatus::Cancelled);
    h.assert_nothing_leaked();
}

#[tokio::test]
async fn test_storage_hangup_with_error_is_partial() {
    let h = Harness::new(
        CheckInReply::Work(vec![assignment("alpha", &["etc"])]),
        TunnelBehavior::ExitsWithError,
    );
    let summary = h.orchestrator(&["etc"]).run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::Reporting);
    assert!(!summary.is_success());
    assert_eq!(summary.sessions[0].status, ReportStatus::Failed);
    h.assert_nothing_leaked();
}

#[tokio::test]
async fn test_coordinator_auth_rejection_aborts() {
    let h = Harness::new(CheckInReply::AuthRejected, TunnelBehavior::Completes);
    let summary = h.orchestrator(&["etc"]).run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::Aborted);
    assert_eq!(summary.error.as_ref().map(|e| e.kind()), Some("auth"));
    assert!(h.journal.events().is_empty());
}

#[tokio::test]
async fn test_coordinator_unreachable_is_transport_error() {
    let h = Harness::new(CheckInReply::Unreachable, TunnelBehavior::Completes);
    let summary = h.orchestrator(&["etc"]).run(&CancellationToken::new()).await;

    assert_eq!(summary.state, PingState::Aborted);
    assert_eq!(summary.error.as_ref().map(|e| e.kind()), Some("transport"));
    assert!(h.journal.events().is_empty());
}

#[tokio::test]
async fn test_failed_report_does_not_fail_run() {
    let journal = Arc::new(Journal::default());
    let mut coordinator =
        FakeCoordinator::new(CheckInReply::Work(vec![assignment("alpha", &["etc"])]));
    coordinator.fail_reports = true;
    let h = Harness {
        daemons: Arc::new(FakeDaemons::new(Arc::clone(&journal))),
        tunnels: Arc::new(FakeTunnels::new(Arc::clone(&journal), TunnelBehavior::Completes)),
        coordinator: Arc::new(coordinator),
        journal,
    };
    let summary = h.orchestrator(&["etc"]).run(&CancellationToken::new()).await;

    assert!(summary.is_success());
    assert_eq!(h.coordinator.reports.lock().unwrap().len(), 1);
    h.assert_nothing_leaked();
}
