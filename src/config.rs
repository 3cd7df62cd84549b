//! Audit configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields the built-in
//! host, timings and port tables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ports::{KnownPorts, COMMON_PORTS, EXPECTED_PORTS};
use crate::scanner::BatchOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A labeled port entry in the `expected` / `common` tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Host to audit, literal IP or hostname.
    pub host: String,

    /// Connect timeout for batch and sweep probes.
    pub timeout_ms: u64,

    /// Connect timeout for single-port checks.
    pub check_timeout_ms: u64,

    pub banner_timeout_ms: u64,

    /// Maximum probes in flight.
    pub concurrency: usize,

    pub expected: Vec<PortEntry>,

    pub common: Vec<PortEntry>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            timeout_ms: 500,
            check_timeout_ms: 2000,
            banner_timeout_ms: 2000,
            concurrency: 200,
            expected: entries(EXPECTED_PORTS),
            common: entries(COMMON_PORTS),
        }
    }
}

fn entries(table: &[(u16, &str)]) -> Vec<PortEntry> {
    table
        .iter()
        .map(|&(port, label)| PortEntry {
            port,
            label: label.to_string(),
        })
        .collect()
}

fn to_map(v: &[PortEntry]) -> BTreeMap<u16, String> {
    v.iter().map(|e| (e.port, e.label.clone())).collect()
}

impl AuditConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: AuditConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if let Some(e) = self.expected.iter().chain(&self.common).find(|e| e.port == 0) {
            return Err(ConfigError::Invalid(format!(
                "port 0 is not valid (label {:?})",
                e.label
            )));
        }
        Ok(())
    }

    pub fn known_ports(&self) -> KnownPorts {
        KnownPorts {
            expected: to_map(&self.expected),
            common: to_map(&self.common),
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            concurrency: self.concurrency,
            timeout: Duration::from_millis(self.timeout_ms),
            banner_timeout: Duration::from_millis(self.banner_timeout_ms),
        }
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_builtin_tables() {
        let cfg = AuditConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.known_ports(), KnownPorts::builtin());
        assert_eq!(cfg.batch_options().timeout, Duration::from_millis(500));
    }

    #[test]
    fn tables_can_be_replaced() {
        let cfg = AuditConfig::from_toml_str(
            r#"
            host = "10.0.0.5"
            concurrency = 50
            expected = [{ port = 22, label = "SSH" }]
            common = []
            "#,
        )
        .unwrap();
        let known = cfg.known_ports();
        assert_eq!(known.expected.len(), 1);
        assert!(known.common.is_empty());
        assert_eq!(cfg.batch_options().concurrency, 50);
    }

    #[test]
    fn rejects_zero_concurrency_and_port() {
        assert!(matches!(
            AuditConfig::from_toml_str("concurrency = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AuditConfig::from_toml_str(r#"expected = [{ port = 0, label = "x" }]"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            AuditConfig::from_toml_str("host = "),
            Err(ConfigError::Parse(_))
        ));
    }
}
