//! Session configuration.
//!
//! Loaded from TOML. Every field has a default, so a partial file (or no
//! file at all) is fine:
//!
//! ```toml
//! port = 10012
//! sync_timeout_ms = 10000
//! teardown = "fail"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::NameSlot;
use crate::ipc::DEFAULT_MAX_BUFFER;

/// What happens to outstanding requests when a session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownPolicy {
    /// Drop them without running callbacks.
    #[default]
    Abandon,
    /// Run each failure callback with a "connection closed" failure.
    Fail,
}

impl TeardownPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownPolicy::Abandon => "abandoned",
            TeardownPolicy::Fail => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Connection attempts before giving up.
    pub connect_attempts: u32,
    /// Fixed delay between connection attempts.
    pub retry_delay_ms: u64,
    /// Budget for synchronous calls.
    pub sync_timeout_ms: u64,
    /// Cap on buffered partial-response bytes.
    pub max_buffer_bytes: usize,
    /// Code longer than this many bytes is sent through a temp file.
    pub inline_limit: usize,
    /// Expression that loads a spilled temp file; `{path}` is replaced with
    /// the escaped file path.
    pub tmpfile_loader: String,
    pub base_names_query: String,
    pub core_names_query: String,
    pub teardown: TeardownPolicy,
    /// Sent lines kept in the session transcript.
    pub transcript_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10011,
            connect_attempts: 5,
            retry_delay_ms: 500,
            sync_timeout_ms: 5000,
            max_buffer_bytes: DEFAULT_MAX_BUFFER,
            inline_limit: 4096,
            tmpfile_loader: "include(\"{path}\")".to_string(),
            base_names_query: "string.(names(Base))".to_string(),
            core_names_query: "string.(names(Core))".to_string(),
            teardown: TeardownPolicy::Abandon,
            transcript_lines: 500,
        }
    }
}

impl SessionConfig {
    /// Default config file location (`<config dir>/snailwire/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("snailwire").join("config.toml"))
    }

    /// Parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse TOML")
    }

    /// Load `path` if given, else the default location if it exists, else
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Using config {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn names_query(&self, slot: NameSlot) -> &str {
        match slot {
            NameSlot::Base => &self.base_names_query,
            NameSlot::Core => &self.core_names_query,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SessionConfig::from_toml(
            r#"
            port = 4000
            teardown = "fail"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.teardown, TeardownPolicy::Fail);
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.addr(), "127.0.0.1:4000");
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SessionConfig::from_toml("").unwrap(), SessionConfig::default());
    }

    #[test]
    fn test_bad_policy_is_rejected() {
        assert!(SessionConfig::from_toml("teardown = \"explode\"").is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let err = SessionConfig::load(Path::new("/nonexistent/snailwire.toml")).unwrap_err();
        assert!(
            format!("{err:#}").contains("/nonexistent/snailwire.toml"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn test_durations_and_queries() {
        let config = SessionConfig::default();
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        assert_eq!(config.sync_timeout(), Duration::from_secs(5));
        assert_eq!(config.names_query(NameSlot::Core), "string.(names(Core))");
    }
}
