// File: src/config.rs

//! Replica configuration

use std::net::SocketAddr;

use crate::backfill::BackfillConfig;
use crate::consistency::ProjectionPolicy;
use crate::ingest::IngestConfig;
use crate::storage::SqliteConfig;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub database_path: String,
    pub log_level: String,

    /// How revisions above an open gap reach the projections
    pub projection_policy: ProjectionPolicy,

    /// Use SQLite WAL journaling
    pub wal_mode: bool,

    /// SQLite busy timeout (milliseconds)
    pub busy_timeout_ms: u32,

    /// Prometheus listen address; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,

    pub ingest: IngestConfig,
    pub backfill: BackfillConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            database_path: "./replica.db".to_string(),
            log_level: "info".to_string(),
            projection_policy: ProjectionPolicy::default(),
            wal_mode: true,
            busy_timeout_ms: 5000,
            metrics_addr: None,
            ingest: IngestConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

impl ReplicaConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("REPLICA_DATABASE_PATH").unwrap_or(defaults.database_path),
            log_level: std::env::var("REPLICA_LOG_LEVEL").unwrap_or(defaults.log_level),
            projection_policy: std::env::var("REPLICA_PROJECTION_POLICY")
                .ok()
                .and_then(|s| ProjectionPolicy::parse(&s))
                .unwrap_or(defaults.projection_policy),
            wal_mode: std::env::var("REPLICA_WAL_MODE")
                .ok()
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.wal_mode),
            busy_timeout_ms: std::env::var("REPLICA_BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.busy_timeout_ms),
            metrics_addr: std::env::var("REPLICA_METRICS_ADDR")
                .ok()
                .and_then(|s| s.parse().ok()),
            ingest: IngestConfig::from_env(),
            backfill: BackfillConfig::from_env(),
        }
    }

    /// Storage settings derived from this configuration
    pub fn sqlite(&self) -> SqliteConfig {
        SqliteConfig {
            path: self.database_path.clone(),
            wal_mode: self.wal_mode,
            busy_timeout_ms: self.busy_timeout_ms,
            ..SqliteConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for var in [
            "REPLICA_DATABASE_PATH",
            "REPLICA_LOG_LEVEL",
            "REPLICA_PROJECTION_POLICY",
            "REPLICA_WAL_MODE",
            "REPLICA_BUSY_TIMEOUT_MS",
            "REPLICA_METRICS_ADDR",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = ReplicaConfig::default();
        assert_eq!(config.database_path, "./replica.db");
        assert_eq!(config.projection_policy, ProjectionPolicy::Deferred);
        assert!(config.wal_mode);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear();
        let config = ReplicaConfig::from_env();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.projection_policy, ProjectionPolicy::Deferred);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_custom() {
        std::env::set_var("REPLICA_DATABASE_PATH", "/tmp/r.db");
        std::env::set_var("REPLICA_PROJECTION_POLICY", "optimistic");
        std::env::set_var("REPLICA_WAL_MODE", "false");
        std::env::set_var("REPLICA_METRICS_ADDR", "127.0.0.1:9464");

        let config = ReplicaConfig::from_env();
        assert_eq!(config.database_path, "/tmp/r.db");
        assert_eq!(config.projection_policy, ProjectionPolicy::Optimistic);
        assert!(!config.wal_mode);
        assert_eq!(config.sqlite().path, "/tmp/r.db");
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9464".parse().unwrap()));
        clear();
    }

    #[test]
    #[serial]
    fn test_unknown_policy_uses_default() {
        std::env::set_var("REPLICA_PROJECTION_POLICY", "eventually");
        let config = ReplicaConfig::from_env();
        assert_eq!(config.projection_policy, ProjectionPolicy::Deferred);
        clear();
    }
}
