// File: src/backfill/config.rs

//! Backfill worker pool and sweep configuration

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|s| s == "true" || s == "1")
}

/// Periodic consistency sweep
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Compare each tree's root with the canonical head and queue a forced
    /// check on mismatch
    pub audit_roots: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            audit_roots: false,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Run no workers and no sweep
    pub disabled: bool,

    pub worker_count: usize,

    /// Tree lease duration (milliseconds)
    pub lease_ms: u64,

    /// Queue poll interval when no notification arrives (milliseconds)
    pub poll_interval_ms: u64,

    /// Attempts per segment fetch on transient failures
    pub fetch_retry_count: u32,

    /// Base delay for fetch backoff (milliseconds)
    pub fetch_retry_base_ms: u64,

    /// Ceiling for a single fetch backoff delay (milliseconds)
    pub fetch_retry_max_ms: u64,

    /// Delay before a released item may be claimed again (seconds)
    pub retry_cooldown_secs: u64,

    /// Consecutive root mismatches after full replay before the tree halts
    pub max_root_mismatches: u32,

    pub sweep: SweepConfig,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            worker_count: 4,
            lease_ms: 30_000,
            poll_interval_ms: 5_000,
            fetch_retry_count: 5,
            fetch_retry_base_ms: 100,
            fetch_retry_max_ms: 10_000,
            retry_cooldown_secs: 30,
            max_root_mismatches: 3,
            sweep: SweepConfig::default(),
        }
    }
}

impl BackfillConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            disabled: env_bool("REPLICA_BACKFILL_DISABLED").unwrap_or(d.disabled),
            worker_count: env_parse("REPLICA_BACKFILL_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.worker_count),
            lease_ms: env_parse("REPLICA_BACKFILL_LEASE_MS")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(d.lease_ms),
            poll_interval_ms: env_parse("REPLICA_BACKFILL_POLL_INTERVAL_MS")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(d.poll_interval_ms),
            fetch_retry_count: env_parse("REPLICA_BACKFILL_FETCH_RETRY_COUNT")
                .unwrap_or(d.fetch_retry_count),
            fetch_retry_base_ms: env_parse("REPLICA_BACKFILL_FETCH_RETRY_BASE_MS")
                .unwrap_or(d.fetch_retry_base_ms),
            fetch_retry_max_ms: env_parse("REPLICA_BACKFILL_FETCH_RETRY_MAX_MS")
                .unwrap_or(d.fetch_retry_max_ms),
            retry_cooldown_secs: env_parse("REPLICA_BACKFILL_RETRY_COOLDOWN_SECS")
                .unwrap_or(d.retry_cooldown_secs),
            max_root_mismatches: env_parse("REPLICA_BACKFILL_MAX_ROOT_MISMATCHES")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(d.max_root_mismatches),
            sweep: SweepConfig {
                enabled: env_bool("REPLICA_SWEEP_ENABLED").unwrap_or(d.sweep.enabled),
                interval_secs: env_parse("REPLICA_SWEEP_INTERVAL_SECS")
                    .filter(|n: &u64| *n > 0)
                    .unwrap_or(d.sweep.interval_secs),
                audit_roots: env_bool("REPLICA_SWEEP_AUDIT_ROOTS").unwrap_or(d.sweep.audit_roots),
            },
        }
    }

    /// Backoff before retry number `retry` (0-based): doubles from the base,
    /// never above `fetch_retry_max_ms`
    pub fn fetch_retry_delay_ms(&self, retry: u32) -> u64 {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        self.fetch_retry_base_ms
            .saturating_mul(factor)
            .min(self.fetch_retry_max_ms)
    }

    /// Lease renewal interval: a third of the lease
    pub fn renew_every_ms(&self) -> u64 {
        (self.lease_ms / 3).max(1)
    }
}
