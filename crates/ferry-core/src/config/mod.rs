//! Configuration management for ferry
//!
//! Configuration is layered. Agent-written state under
//! `<var_dir>/config.d/*.json` sits at the bottom, the operator's
//! `<config_dir>/config.d/*.{toml,json}` overrides it, and sources come from
//! `<config_dir>/sources.d/*.{toml,json}`. Files in a directory are applied
//! in name order; maps merge recursively, everything else replaces.

mod agent;
pub mod serde_utils;

pub use agent::{AgentConfig, ProgramSpec};

use crate::error::ConfigError;
use crate::types::Source;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default operator configuration directory
pub const DEFAULT_CONFIG_DIR: &str = "/etc/ferry-agent";

/// Default agent state directory
pub const DEFAULT_VAR_DIR: &str = "/var/lib/ferry-agent";

/// File the machine identity is persisted to, under `<var_dir>/config.d`
pub const IDENTITY_FILE_NAME: &str = "10-machine_uuid.json";

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_DIR)
}

/// Load and merge every config layer rooted at `config_dir`
pub fn load_agent_config(config_dir: &Path) -> Result<AgentConfig, ConfigError> {
    let etc_layer = load_dir(&config_dir.join("config.d"), true)?;

    let var_dir = etc_layer
        .get("var_dir")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VAR_DIR));

    // /etc wins over /var
    let mut merged = load_dir(&var_dir.join("config.d"), false)?;
    merge(&mut merged, etc_layer);

    // Sources are handled separately so one bad entry does not sink the rest
    if let Value::Object(map) = &mut merged {
        map.remove("sources");
    }

    let mut config: AgentConfig = serde_json::from_value(merged)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    config.config_dir = config_dir.to_path_buf();
    config.var_dir = var_dir;
    config.sources = load_sources(&config_dir.join("sources.d"))?;

    tracing::debug!(
        "Loaded config from {:?} ({} sources)",
        config_dir,
        config.sources.len()
    );
    Ok(config)
}

/// Load `sources.d`, dropping entries that lack a usable `path`
pub fn load_sources(dir: &Path) -> Result<BTreeMap<String, Source>, ConfigError> {
    let merged = load_dir(dir, true)?;
    let mut sources = BTreeMap::new();

    if let Value::Object(map) = merged {
        for (name, value) in map {
            match Source::from_value(value) {
                Some(source) => {
                    sources.insert(name, source);
                }
                None => tracing::warn!("Ignoring source '{}': no path configured", name),
            }
        }
    }

    Ok(sources)
}

/// Merge every config file in `dir` in name order.
///
/// A missing directory is an empty layer. `.toml` files are only read when
/// `allow_toml` is set.
pub fn load_dir(dir: &Path, allow_toml: bool) -> Result<Value, ConfigError> {
    let mut merged = Value::Object(serde_json::Map::new());
    if !dir.is_dir() {
        return Ok(merged);
    }

    let entries = fs::read_dir(dir).map_err(|e| ConfigError::Read {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| match path.extension().and_then(|e| e.to_str()) {
            Some("json") => true,
            Some("toml") => allow_toml,
            _ => false,
        })
        .collect();
    files.sort();

    for file in files {
        merge(&mut merged, load_file(&file)?);
    }
    Ok(merged)
}

/// Parse one `.toml` or `.json` file into an untyped document
pub fn load_file(path: &Path) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_path_buf(),
            source: e,
        })
    } else {
        serde_json::from_str(&content).map_err(|e| ConfigError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Recursively merge `overlay` into `base`
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_object()
                    && base_map.get(&key).map_or(false, Value::is_object);
                if nested {
                    if let Some(existing) = base_map.get_mut(&key) {
                        merge(existing, value);
                    }
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Write a JSON document next to `path` and rename it into place.
///
/// On Unix the file is created with `mode` before any content is written.
pub fn write_json_atomic(path: &Path, value: &Value, mode: u32) -> Result<(), ConfigError> {
    let write_err = |e: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ConfigError::Invalid(format!("not a file path: {:?}", path)))?;
    let temp = path.with_file_name(format!(".{}.tmp{}", file_name, std::process::id()));

    let content = serde_json::to_string_pretty(value)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&temp).map_err(write_err)?;
    file.write_all(content.as_bytes()).map_err(write_err)?;
    file.write_all(b"\n").map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp, path).map_err(write_err)
}
