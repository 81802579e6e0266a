use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JqlError, JqlResult};

/// Engine and migrator settings. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub security: SecurityConfig,
    pub migration: MigrationConfig,
    pub naming: NamingConfig,
    /// Statement timeout used when a query has no `timeout` of its own.
    pub query_timeout_ms: Option<u64>,
    /// Attach `meta` to every result, not only to queries with `debug: true`.
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Gate UPDATE/DELETE without a `where` behind a confirmation token.
    pub confirm_destructive: bool,
    /// Row count above which the gate applies.
    pub confirm_threshold: i64,
    /// Lifetime of an issued confirmation token.
    pub confirm_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Also drop undeclared tables and columns.
    pub aggressive: bool,
    /// Copy data aside before destructive changes.
    pub auto_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub primary_key: String,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            security: SecurityConfig::default(),
            migration: MigrationConfig::default(),
            naming: NamingConfig::default(),
            query_timeout_ms: None,
            debug: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            confirm_destructive: true,
            confirm_threshold: 10,
            confirm_ttl_secs: 300,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            aggressive: false,
            auto_backup: true,
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            primary_key: "id".to_owned(),
            created_at: "created_at".to_owned(),
            updated_at: "updated_at".to_owned(),
            deleted_at: "deleted_at".to_owned(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> JqlResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> JqlResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| JqlError::Message(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub fn confirm_ttl(&self) -> Duration {
        Duration::from_secs(self.security.confirm_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.security.confirm_destructive);
        assert_eq!(config.security.confirm_threshold, 10);
        assert!(!config.migration.aggressive);
        assert!(config.migration.auto_backup);
        assert_eq!(config.naming.primary_key, "id");
        assert!(config.query_timeout().is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_json(
            r#"{"security": {"confirm_threshold": 0}, "query_timeout_ms": 1500}"#,
        )
        .unwrap();
        assert_eq!(config.security.confirm_threshold, 0);
        assert!(config.security.confirm_destructive);
        assert_eq!(config.query_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/jql.json").is_err());
    }
}
