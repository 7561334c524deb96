//! Layered configuration: a TOML file provides the bulk of the settings, a handful
//! of environment variables can override the connection strings, and CLI flags
//! (see the `bin/` entry points) take precedence over both.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

fn default_database_location() -> Option<String> {
    None
}

fn default_redis_location() -> Option<String> {
    None
}

fn default_max_connections() -> u32 {
    5
}

fn default_sensitive_host_substrings() -> Vec<String> {
    vec!["salsa.debian.org/debian/".to_string()]
}

/// Top-level configuration, as loaded from `fleetbot.toml` (or an equivalent path
/// passed via `--config`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// PostgreSQL connection string. Falls back to `DATABASE_URL`/libpq defaults
    /// when unset.
    #[serde(default = "default_database_location")]
    pub database_location: Option<String>,

    /// Maximum number of pooled database connections.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    /// Redis connection string used for the worker-result pub/sub channel.
    #[serde(default = "default_redis_location")]
    pub redis_location: Option<String>,

    /// Declared campaigns, keyed by name.
    #[serde(default)]
    pub campaigns: HashMap<String, CampaignConfig>,

    /// Named publish policies, keyed by name (referenced by `candidate.publish_policy`).
    #[serde(default)]
    pub policies: HashMap<String, crate::policy::NamedPolicy>,

    /// URL substrings identifying forge namespaces that are collaboratively owned;
    /// `attempt-push` is downgraded to `propose` for matching target branches.
    #[serde(default = "default_sensitive_host_substrings")]
    pub sensitive_host_substrings: Vec<String>,

    /// External base URL of this deployment, used to build links in publish records.
    pub external_url: Option<url::Url>,
}

/// Per-campaign static configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Shell command template used when no candidate-specific command is recorded.
    pub command: String,
    /// Build target class: determines which capability set (`DebianTarget` vs.
    /// `GenericTarget`, see §9 of the design notes) the worker uses.
    #[serde(default)]
    pub target: TargetKind,
    /// Name of the branch this campaign publishes to by convention.
    pub branch_name: Option<String>,
}

/// The two build-target shapes the platform supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// A Debian packaging build (dpkg-buildpackage, lintian, etc).
    Debian,
    /// Any other build command with no packaging-specific handling.
    #[default]
    Generic,
}

impl Config {
    /// Read and parse a TOML configuration file.
    pub fn read_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)?;
        Self::read_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn read_str(contents: &str) -> Result<Config> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Resolve the effective database URL: an explicit CLI/file value wins, then
    /// `DATABASE_URL`, then libpq's own defaults (handled by sqlx when `None`).
    pub fn database_url(&self) -> Option<String> {
        self.database_location
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }

    /// Resolve the effective Redis URL, same precedence as [`Config::database_url`].
    pub fn redis_url(&self) -> Option<String> {
        self.redis_location
            .clone()
            .or_else(|| std::env::var("REDIS_URL").ok())
    }

    /// Look up a declared campaign by name.
    pub fn campaign(&self, name: &str) -> Option<&CampaignConfig> {
        self.campaigns.get(name)
    }

    /// Create a Postgres connection pool from this configuration.
    pub async fn pg_pool(&self) -> std::result::Result<sqlx::PgPool, sqlx::Error> {
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

        let pool_options =
            PgPoolOptions::new().max_connections(self.database_max_connections);
        if let Some(url) = self.database_url() {
            pool_options.connect(&url).await
        } else {
            pool_options.connect_with(PgConnectOptions::new()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let config = Config::read_str(
            r#"
            database_location = "postgresql://localhost/fleetbot"

            [campaigns.lintian-fixes]
            command = "lintian-brush"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.database_location.as_deref(),
            Some("postgresql://localhost/fleetbot")
        );
        assert_eq!(
            config.campaign("lintian-fixes").unwrap().command,
            "lintian-brush"
        );
        assert_eq!(config.campaign("lintian-fixes").unwrap().target, TargetKind::Generic);
    }

    #[test]
    fn defaults_apply_on_empty_document() {
        let config = Config::read_str("").unwrap();
        assert!(config.database_location.is_none());
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(
            config.sensitive_host_substrings,
            vec!["salsa.debian.org/debian/".to_string()]
        );
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::read_str("not = [valid").is_err());
    }

    #[test]
    fn env_override_for_database_url() {
        let config = Config::read_str("").unwrap();
        // With no file value and no env var set in this test process, falls through
        // to None (sqlx then uses libpq defaults).
        if std::env::var("DATABASE_URL").is_err() {
            assert_eq!(config.database_url(), None);
        }
    }
}
