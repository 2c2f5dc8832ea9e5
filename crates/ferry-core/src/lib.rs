//! ferry-core: Core abstractions and configuration for the ferry agent
//!
//! This crate provides the domain types shared by the agent (machine
//! identity, sources, storage units, session outcomes), the configuration
//! loader that merges the layered config directories, and the run lock that
//! keeps a host down to one agent run at a time.

pub mod config;
pub mod error;
pub mod lock;
pub mod types;

pub use error::{ConfigError, LockError};
pub use types::{AccessMode, MachineId, Source, StorageUnit};
