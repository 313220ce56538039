// File: src/ingest/config.rs

//! Ingest stream configuration

/// Ingest stream configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Maximum number of transactions handed to one blocking task
    pub batch_size: usize,

    /// Maximum time to hold a partial batch (milliseconds)
    pub batch_timeout_ms: u64,

    /// Bounded channel capacity (backpressure threshold)
    pub buffer_size: usize,

    /// Attempts per transaction on recoverable storage errors
    pub retry_count: u32,

    /// Base delay for exponential backoff (milliseconds)
    pub retry_base_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            batch_timeout_ms: 50,
            buffer_size: 10_000,
            retry_count: 3,
            retry_base_ms: 10,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("REPLICA_INGEST_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            batch_timeout_ms: std::env::var("REPLICA_INGEST_BATCH_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_timeout_ms),
            buffer_size: std::env::var("REPLICA_INGEST_BUFFER_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.buffer_size),
            retry_count: std::env::var("REPLICA_INGEST_RETRY_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_count),
            retry_base_ms: std::env::var("REPLICA_INGEST_RETRY_BASE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_base_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "REPLICA_INGEST_BATCH_SIZE",
        "REPLICA_INGEST_BATCH_TIMEOUT_MS",
        "REPLICA_INGEST_BUFFER_SIZE",
        "REPLICA_INGEST_RETRY_COUNT",
        "REPLICA_INGEST_RETRY_BASE_MS",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = IngestConfig::default();
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.batch_timeout_ms, 50);
        assert_eq!(config.buffer_size, 10_000);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_base_ms, 10);
    }

    #[test]
    #[serial]
    fn test_from_env_uses_defaults_when_no_env_vars() {
        clear();
        let config = IngestConfig::from_env();
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.buffer_size, 10_000);
    }

    #[test]
    #[serial]
    fn test_from_env_all_vars_custom() {
        std::env::set_var("REPLICA_INGEST_BATCH_SIZE", "32");
        std::env::set_var("REPLICA_INGEST_BATCH_TIMEOUT_MS", "5");
        std::env::set_var("REPLICA_INGEST_BUFFER_SIZE", "64");
        std::env::set_var("REPLICA_INGEST_RETRY_COUNT", "7");
        std::env::set_var("REPLICA_INGEST_RETRY_BASE_MS", "15");

        let config = IngestConfig::from_env();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.batch_timeout_ms, 5);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.retry_count, 7);
        assert_eq!(config.retry_base_ms, 15);
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_zero_buffer_uses_default() {
        std::env::set_var("REPLICA_INGEST_BUFFER_SIZE", "0");
        std::env::set_var("REPLICA_INGEST_BATCH_SIZE", "not_a_number");
        let config = IngestConfig::from_env();
        assert_eq!(config.buffer_size, 10_000);
        assert_eq!(config.batch_size, 256);
        clear();
    }
}
