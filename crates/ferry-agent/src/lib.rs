//! ferry backup agent
//!
//! Runs on the machine being backed up. On each scheduled invocation it asks
//! the coordinator whether any sources are due; if so it starts a
//! loopback-only rsync daemon with single-use credentials and opens a
//! reverse ssh tunnel so the assigned storage unit can pull through it.
//! Restore mode runs the same machinery with a writable module and waits
//! for an operator.

pub mod coordinator;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod gonogo;
pub mod orchestrator;
pub mod process;
pub mod registration;
pub mod restore;
pub mod session;
pub mod shutdown;
pub mod tunnel;

pub use coordinator::{CheckIn, Coordinator, CoordinatorClient, MachineAuth};
pub use error::{CoordinatorError, DaemonError, SessionError, TunnelError};
pub use orchestrator::{PingOrchestrator, PingState, RunSummary};
pub use restore::RestoreController;
pub use session::Launchers;
