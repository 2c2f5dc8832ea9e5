//! Run lock for single-instance agent runs
//!
//! Every agent invocation holds an exclusive lock on a lock file for its
//! whole lifetime, so two scheduler ticks can never prepare sessions at the
//! same time. The file carries the holder's PID for diagnostics. It stays on
//! disk after release; only the handle goes away, so every run locks the
//! same inode.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::LockError;

/// Default lock file name
const LOCK_FILE_NAME: &str = "ferry-agent.lock";

/// Candidate lock directories, in order of preference
const LOCK_DIR_CANDIDATES: &[&str] = &["/run/lock", "/var/lock", "/run", "/var/run", "/tmp"];

/// Pick the first existing candidate lock directory
pub fn default_lock_dir() -> Option<PathBuf> {
    LOCK_DIR_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|dir| dir.is_dir())
}

/// Read the PID recorded in a lock file
///
/// Returns `Ok(Some(pid))` if the file exists and contains a valid PID,
/// `Ok(None)` if the file doesn't exist or is empty.
pub fn read_lock_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let pid = trimmed
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Guard holding the run lock; released when dropped
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: Option<fs::File>,
}

impl RunLock {
    /// Acquire the lock in `lock_dir`, or the first available default directory
    pub fn acquire(lock_dir: Option<&Path>) -> Result<Self, LockError> {
        let dir = match lock_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_lock_dir().ok_or(LockError::NoLockDir)?,
        };
        Self::acquire_at(dir.join(LOCK_FILE_NAME))
    }

    /// Acquire the lock on an explicit file path
    pub fn acquire_at(path: PathBuf) -> Result<Self, LockError> {
        let io_err = |path: &Path, e: io::Error| LockError::Io {
            path: path.to_path_buf(),
            source: e,
        };

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if is_contended(&e) {
                let pid = read_lock_pid(&path).ok().flatten();
                return Err(LockError::Held { path, pid });
            }
            return Err(io_err(&path, e));
        }

        file.set_len(0).map_err(|e| io_err(&path, e))?;
        file.rewind().map_err(|e| io_err(&path, e))?;
        writeln!(file, "{}", std::process::id()).map_err(|e| io_err(&path, e))?;
        file.flush().map_err(|e| io_err(&path, e))?;

        tracing::debug!("Acquired run lock {:?}", path);
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                tracing::warn!("Failed to release run lock {:?}: {}", self.path, e);
            }
            tracing::debug!("Released run lock {:?}", self.path);
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
