//! Machine registration and source sync
//!
//! `update-config` fills in whatever identity the machine is missing (UUID,
//! secret, SSH key), persists it under the state directory, and pushes the
//! machine's description and sources to the coordinator.

use std::path::Path;

use serde_json::json;
use thiserror::Error;

use ferry_core::config::{write_json_atomic, AgentConfig, IDENTITY_FILE_NAME};
use ferry_core::{ConfigError, MachineId};

use crate::coordinator::{Coordinator, MachineProfile, RegistrationAuth};
use crate::credentials::new_machine_secret;
use crate::error::{CoordinatorError, CredentialError};

/// Registration failures
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Required config \"{0}\" not found")]
    Incomplete(&'static str),

    #[error("Failed to create {path}: {source}")]
    Directory {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("SSH key generation failed: {0}")]
    KeyGen(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Create the configuration and state directories
pub fn ensure_directories(config: &AgentConfig) -> Result<(), RegistrationError> {
    for dir in [
        config.config_dir.join("config.d"),
        config.config_dir.join("sources.d"),
        config.var_dir.join("config.d"),
    ] {
        std::fs::create_dir_all(&dir).map_err(|source| RegistrationError::Directory {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Generate a machine UUID and secret if either is missing.
///
/// Returns true when anything was generated and persisted.
pub fn ensure_identity(config: &mut AgentConfig) -> Result<bool, RegistrationError> {
    if config.machine_credentials().is_some() {
        return Ok(false);
    }
    if config.machine_uuid.is_none() {
        config.machine_uuid = Some(MachineId::generate());
    }
    if config.machine_secret.is_none() {
        config.machine_secret = Some(new_machine_secret()?);
    }
    persist_identity(config)?;
    tracing::info!("Generated machine identity");
    Ok(true)
}

/// Write the machine UUID and secret to `<var_dir>/config.d`
pub fn persist_identity(config: &AgentConfig) -> Result<(), ConfigError> {
    let path = config.var_dir.join("config.d").join(IDENTITY_FILE_NAME);
    let value = json!({
        "machine_uuid": config.machine_uuid,
        "machine_secret": config.machine_secret,
    });
    write_json_atomic(&path, &value, 0o600)
}

/// Generate an SSH key pair at `path` if there is none
pub async fn ensure_ssh_key(path: &Path, key_type: &str) -> Result<(), RegistrationError> {
    if path.exists() {
        tracing::debug!("Using existing SSH key at {:?}", path);
        return Ok(());
    }

    tracing::info!("Generating new SSH key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| RegistrationError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let output = tokio::process::Command::new("ssh-keygen")
        .args([
            "-q",
            "-t",
            key_type,
            "-f",
            &path.to_string_lossy(),
            "-N",
            "", // No passphrase
            "-C",
            "ferry-agent",
        ])
        .output()
        .await
        .map_err(|e| RegistrationError::KeyGen(format!("failed to run ssh-keygen: {}", e)))?;

    if !output.status.success() {
        return Err(RegistrationError::KeyGen(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    tracing::info!("SSH key generated successfully");
    Ok(())
}

/// Registration credentials, command line first, then config
///
/// Empty values count as unset wherever they come from.
pub fn registration_auth(
    config: &AgentConfig,
    name: Option<&str>,
    secret: Option<&str>,
) -> Option<RegistrationAuth> {
    fn named(name: Option<&str>, secret: Option<&str>) -> Option<RegistrationAuth> {
        let name = name.filter(|n| !n.is_empty())?;
        let secret = secret.filter(|s| !s.is_empty())?;
        Some(RegistrationAuth::Named {
            name: name.to_string(),
            secret: secret.to_string(),
        })
    }

    named(name, secret)
        .or_else(|| {
            named(
                config.api_auth_name.as_deref(),
                config.api_auth_secret.as_deref(),
            )
        })
        .or_else(|| {
            config
                .api_auth
                .as_deref()
                .filter(|auth| !auth.is_empty())
                .map(|auth| RegistrationAuth::Secret(auth.to_string()))
        })
}

/// Machine description for the coordinator
pub fn machine_profile(config: &AgentConfig) -> Result<MachineProfile, RegistrationError> {
    let (uuid, secret) = config
        .machine_credentials()
        .ok_or(RegistrationError::Incomplete("machine_uuid"))?;
    Ok(MachineProfile {
        uuid,
        secret: secret.to_string(),
        environment_name: config.environment_name.clone(),
        service_name: config.service_name.clone(),
        unit_name: config.unit_name(),
        ssh_public_key: config.ssh_public_key(),
        published: config.published,
        sources: config.sources.clone(),
    })
}

/// Register (when credentials are available) or sync sources.
///
/// A UUID handed back by the coordinator replaces the local one.
pub async fn send_config(
    config: &mut AgentConfig,
    coordinator: &dyn Coordinator,
    auth: Option<RegistrationAuth>,
) -> Result<(), RegistrationError> {
    if config.api_url.is_none() {
        return Err(RegistrationError::Incomplete("api_url"));
    }
    let profile = machine_profile(config)?;

    match auth {
        Some(auth) => {
            let assigned = coordinator.register(&auth, &profile).await?;
            if assigned != profile.uuid {
                tracing::info!("Coordinator assigned machine UUID {}", assigned);
                config.machine_uuid = Some(assigned);
                persist_identity(config)?;
            }
            tracing::info!("Registered machine {}", assigned);
        }
        None => {
            coordinator.sync_sources(&profile).await?;
            tracing::info!("Synced {} source(s)", profile.sources.len());
        }
    }
    Ok(())
}
