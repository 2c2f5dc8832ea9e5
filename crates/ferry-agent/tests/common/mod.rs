//! Shared fakes for session tests
//!
//! The fake launchers record every start, open, request, close and stop in a
//! shared journal so tests can assert ordering and that nothing is leaked.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use ferry_agent::coordinator::{
    Assignment, CheckIn, Coordinator, MachineAuth, MachineProfile, RegistrationAuth,
    SessionReport,
};
use ferry_agent::daemon::{DaemonHandle, DaemonLauncher, ModuleGrant};
use ferry_agent::error::{CoordinatorError, DaemonError, TunnelError};
use ferry_agent::tunnel::{PingRequest, TunnelExit, TunnelHandle, TunnelLauncher};
use ferry_agent::Launchers;
use ferry_core::{MachineId, Source, StorageUnit};

/// Ordered record of everything the fakes did
#[derive(Default)]
pub struct Journal {
    events: Mutex<Vec<String>>,
}

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

/// Fake daemon launcher
pub struct FakeDaemons {
    journal: Arc<Journal>,
    fail: bool,
    next_port: AtomicU16,
    /// Module grants of every daemon started, in order
    pub started: Mutex<Vec<Vec<ModuleGrant>>>,
}

impl FakeDaemons {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            fail: false,
            next_port: AtomicU16::new(40000),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(journal: Arc<Journal>) -> Self {
        Self {
            fail: true,
            ..Self::new(journal)
        }
    }
}

#[async_trait]
impl DaemonLauncher for FakeDaemons {
    async fn start(&self, modules: Vec<ModuleGrant>) -> Result<Box<dyn DaemonHandle>, DaemonError> {
        if self.fail {
            self.journal.record("daemon.fail");
            return Err(DaemonError::ExitedEarly("exit status: 10".into()));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("daemon.start {}", port));
        self.started.lock().unwrap().push(modules.clone());
        Ok(Box::new(FakeDaemon {
            journal: Arc::clone(&self.journal),
            port,
            modules,
            stopped: false,
        }))
    }
}

struct FakeDaemon {
    journal: Arc<Journal>,
    port: u16,
    modules: Vec<ModuleGrant>,
    stopped: bool,
}

#[async_trait]
impl DaemonHandle for FakeDaemon {
    fn address(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn modules(&self) -> &[ModuleGrant] {
        &self.modules
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        if !self.stopped {
            self.stopped = true;
            self.journal.record(format!("daemon.stop {}", self.port));
        }
        Ok(())
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        if !self.stopped {
            self.journal.record("daemon.leaked");
        }
    }
}

/// How fake tunnels behave
#[derive(Clone, Copy, Debug)]
pub enum TunnelBehavior {
    /// Storage unit finishes and hangs up cleanly
    Completes,
    /// Storage unit hangs up with a failure
    ExitsWithError,
    /// Never hangs up
    Hangs,
    /// Host unreachable on open
    Unreachable,
    /// Key rejected on open
    AuthFails,
}

/// Fake tunnel launcher
pub struct FakeTunnels {
    journal: Arc<Journal>,
    behavior: TunnelBehavior,
    next_port: AtomicU16,
    /// JSON of every request sent, in order
    pub requests: Arc<Mutex<Vec<Value>>>,
    /// Storage units connected to, in order
    pub opened: Mutex<Vec<String>>,
}

impl FakeTunnels {
    pub fn new(journal: Arc<Journal>, behavior: TunnelBehavior) -> Self {
        Self {
            journal,
            behavior,
            next_port: AtomicU16::new(50000),
            requests: Arc::new(Mutex::new(Vec::new())),
            opened: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TunnelLauncher for FakeTunnels {
    async fn open(
        &self,
        storage: &StorageUnit,
        local_address: &str,
        local_port: u16,
    ) -> Result<Box<dyn TunnelHandle>, TunnelError> {
        self.opened.lock().unwrap().push(storage.name.clone());
        match self.behavior {
            TunnelBehavior::Unreachable => {
                self.journal.record("tunnel.fail");
                return Err(TunnelError::Unreachable("Connection refused".into()));
            }
            TunnelBehavior::AuthFails => {
                self.journal.record("tunnel.fail");
                return Err(TunnelError::AuthFailed("Permission denied (publickey).".into()));
            }
            _ => {}
        }
        let remote_port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!(
            "tunnel.open {} {}:{} -> {}",
            storage.name, local_address, local_port, remote_port
        ));
        Ok(Box::new(FakeTunnel {
            journal: Arc::clone(&self.journal),
            behavior: self.behavior,
            remote_port,
            requests: Arc::clone(&self.requests),
            closed: false,
        }))
    }
}

struct FakeTunnel {
    journal: Arc<Journal>,
    behavior: TunnelBehavior,
    remote_port: u16,
    requests: Arc<Mutex<Vec<Value>>>,
    closed: bool,
}

#[async_trait]
impl TunnelHandle for FakeTunnel {
    fn remote_port(&self) -> u16 {
        self.remote_port
    }

    async fn send_request(&mut self, request: &PingRequest) -> Result<(), TunnelError> {
        self.journal.record("tunnel.request");
        self.requests.lock().unwrap().push(request.to_json());
        Ok(())
    }

    async fn wait(&mut self) -> Result<TunnelExit, TunnelError> {
        match self.behavior {
            TunnelBehavior::Completes => Ok(TunnelExit {
                success: true,
                detail: "exit status: 0".into(),
            }),
            TunnelBehavior::ExitsWithError => Ok(TunnelExit {
                success: false,
                detail: "exit status: 1".into(),
            }),
            _ => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), TunnelError> {
        if !self.closed {
            self.closed = true;
            self.journal.record(format!("tunnel.close {}", self.remote_port));
        }
        Ok(())
    }
}

impl Drop for FakeTunnel {
    fn drop(&mut self) {
        if !self.closed {
            self.journal.record("tunnel.leaked");
        }
    }
}

/// Scripted check-in answer
pub enum CheckInReply {
    Work(Vec<Assignment>),
    AuthRejected,
    Unreachable,
}

/// In-process coordinator
pub struct FakeCoordinator {
    pub check_in: CheckInReply,
    pub restore: Vec<Assignment>,
    pub fail_reports: bool,
    pub reports: Mutex<Vec<SessionReport>>,
}

impl FakeCoordinator {
    pub fn new(check_in: CheckInReply) -> Self {
        Self {
            check_in,
            restore: Vec::new(),
            fail_reports: false,
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn with_restore(restore: Vec<Assignment>) -> Self {
        Self {
            restore,
            ..Self::new(CheckInReply::Work(Vec::new()))
        }
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn register(
        &self,
        _auth: &RegistrationAuth,
        profile: &MachineProfile,
    ) -> Result<MachineId, CoordinatorError> {
        Ok(profile.uuid)
    }

    async fn sync_sources(&self, _profile: &MachineProfile) -> Result<(), CoordinatorError> {
        Ok(())
    }

    async fn check_in(
        &self,
        _machine: &MachineAuth,
        _local: &BTreeMap<String, Source>,
    ) -> Result<CheckIn, CoordinatorError> {
        match &self.check_in {
            CheckInReply::Work(assignments) if assignments.is_empty() => Ok(CheckIn::NothingToDo),
            CheckInReply::Work(assignments) => Ok(CheckIn::Work(assignments.clone())),
            CheckInReply::AuthRejected => Err(CoordinatorError::AuthRejected { status: 403 }),
            CheckInReply::Unreachable => {
                Err(CoordinatorError::Transport("connection refused".into()))
            }
        }
    }

    async fn restore_lookup(
        &self,
        _machine: &MachineAuth,
        _local: &BTreeMap<String, Source>,
    ) -> Result<Vec<Assignment>, CoordinatorError> {
        Ok(self.restore.clone())
    }

    async fn report(
        &self,
        _machine: &MachineAuth,
        report: &SessionReport,
    ) -> Result<(), CoordinatorError> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail_reports {
            return Err(CoordinatorError::Transport("HTTP 502 Bad Gateway".into()));
        }
        Ok(())
    }
}

pub fn storage(name: &str) -> StorageUnit {
    StorageUnit {
        name: name.into(),
        ssh_ping_host: format!("{}.example.com", name),
        ssh_ping_port: 22,
        ssh_ping_user: "ferry".into(),
        ssh_ping_host_keys: vec!["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5".into()],
    }
}

/// Assignment of `sources` to the storage unit `name`
pub fn assignment(name: &str, sources: &[&str]) -> Assignment {
    Assignment {
        storage: storage(name),
        sources: sources
            .iter()
            .map(|s| {
                let mut attrs = Map::new();
                attrs.insert("path".into(), json!(format!("/{}", s)));
                (s.to_string(), attrs)
            })
            .collect(),
    }
}

/// Local sources named `names`, rooted at `/<name>`
pub fn local_sources(names: &[&str]) -> BTreeMap<String, Source> {
    names
        .iter()
        .map(|n| (n.to_string(), Source::new(format!("/srv/{}", n))))
        .collect()
}

pub fn machine() -> MachineAuth {
    MachineAuth {
        uuid: MachineId::generate(),
        secret: "machine-secret".into(),
    }
}

pub fn launchers(daemons: &Arc<FakeDaemons>, tunnels: &Arc<FakeTunnels>) -> Launchers {
    Launchers {
        daemons: Arc::clone(daemons) as Arc<dyn DaemonLauncher>,
        tunnels: Arc::clone(tunnels) as Arc<dyn TunnelLauncher>,
    }
}
