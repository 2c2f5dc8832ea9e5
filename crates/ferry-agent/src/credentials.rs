//! Per-session credential generation
//!
//! Every sync session gets freshly minted module logins. Secrets come
//! straight from the operating system's CSPRNG; if that fails the session
//! cannot proceed.

use std::fmt;

use rand::distributions::{Alphanumeric, Distribution};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CredentialError;

/// Length of a session token in bytes (before hex encoding)
pub const TOKEN_BYTES: usize = 24;

/// Length of the random part of a module username in bytes
const USERNAME_BYTES: usize = 8;

/// Length of the long-lived machine secret
const MACHINE_SECRET_LEN: usize = 30;

/// A single-use secret.
///
/// `Debug` and `Display` are redacted so a credential can sit inside
/// logged structures without leaking.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// The secret itself, for the daemon's secrets file, the session request
    /// and the operator's restore instructions
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Username and secret for one daemon module
#[derive(Debug, Clone)]
pub struct ModuleLogin {
    pub username: String,
    pub password: Credential,
}

/// Generate `byte_length` random bytes, hex encoded
pub fn new_token(byte_length: usize) -> Result<Credential, CredentialError> {
    let mut bytes = vec![0u8; byte_length];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(Credential(hex::encode(bytes)))
}

/// Mint a fresh login for one module
pub fn new_login() -> Result<ModuleLogin, CredentialError> {
    let mut user = [0u8; USERNAME_BYTES];
    OsRng.try_fill_bytes(&mut user)?;
    Ok(ModuleLogin {
        username: format!("ferry-{}", hex::encode(user)),
        password: new_token(TOKEN_BYTES)?,
    })
}

/// Generate the machine secret presented on every coordinator call
pub fn new_machine_secret() -> Result<String, CredentialError> {
    // Draw one byte first so a broken RNG surfaces as an error, not a panic
    let mut sample = [0u8; 1];
    OsRng.try_fill_bytes(&mut sample)?;
    Ok(Alphanumeric
        .sample_iter(OsRng)
        .take(MACHINE_SECRET_LEN)
        .map(char::from)
        .collect())
}
