//! Connection configuration: resolution and persistence.
//!
//! The backend host is stored as a small JSON document at a per-user path
//! (`~/.ollama/config.json` by default). Resolution never fails: a missing
//! file is the normal first-run case and yields the default host silently,
//! while an unreadable or corrupt file yields it with a warning.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

/// Host used when no connection has been persisted.
pub const DEFAULT_HOST: &str = "http://127.0.0.1:11434";

/// Resolved backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Absolute base URL of the backend, without a trailing slash.
    #[serde(rename = "Host")]
    pub host: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
        }
    }
}

/// Reads and writes the persisted connection file.
///
/// [`resolve`](Self::resolve) is a pure read; [`persist`](Self::persist) is
/// the only point that mutates stored state. Writers fully overwrite the
/// file; last writer wins, no locking.
#[derive(Debug, Clone)]
pub struct ConnectionStore {
    path: PathBuf,
}

impl ConnectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Per-user config location, `~/.ollama/config.json`.
    ///
    /// Falls back to a path relative to the working directory when no home
    /// directory can be determined.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ollama")
            .join("config.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted connection, falling back to the default host.
    ///
    /// The parsed document is returned verbatim; only the `Host` field is
    /// required.
    pub async fn resolve(&self) -> ConnectionConfig {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return ConnectionConfig::default(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read connection config, using default host"
                );
                return ConnectionConfig::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to parse connection config, using default host"
                );
                ConnectionConfig::default()
            }
        }
    }

    /// Persist `host` as the backend for future calls.
    ///
    /// Trims any trailing `/`, requires an absolute URL with scheme and
    /// authority, creates the containing directory if needed and overwrites
    /// the file. Returns the config that was written.
    pub async fn persist(&self, host: &str) -> Result<ConnectionConfig, ConfigError> {
        let host = host.trim_end_matches('/');
        let parsed = url::Url::parse(host).map_err(|e| ConfigError::InvalidHost {
            host: host.to_string(),
            source: e,
        })?;
        if !parsed.has_authority() {
            return Err(ConfigError::HostWithoutAuthority {
                host: host.to_string(),
            });
        }

        let config = ConnectionConfig {
            host: host.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(&config)?;
        fs::write(&self.path, contents).await?;
        Ok(config)
    }
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

/// Errors from persisting the connection configuration.
///
/// Read-side failures are not represented here; `resolve` recovers from them
/// locally.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid host url `{host}`: {source}")]
    InvalidHost {
        host: String,
        source: url::ParseError,
    },

    #[error("host url `{host}` has no authority")]
    HostWithoutAuthority { host: String },

    #[error("failed to write connection config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize connection config: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Tests
// ============================================================================
