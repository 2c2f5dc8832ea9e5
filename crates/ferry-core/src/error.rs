//! Core error types for ferry

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be written
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("TOML parse error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// JSON parse error
    #[error("JSON parse error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Merged document did not match the expected shape
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Run lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// None of the candidate lock directories exist
    #[error("No suitable lock directory found")]
    NoLockDir,

    /// Another agent run holds the lock
    #[error("Another agent run is active (lock {path}, pid {pid:?})")]
    Held { path: PathBuf, pid: Option<u32> },

    /// I/O error while creating or locking the file
    #[error("Lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
