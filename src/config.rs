//! Host-supplied configuration structs.
//!
//! The core never reads these from disk (configuration loading is a collaborator
//! concern per the scope notes); every struct here is plain data with a
//! conservative `Default`, the same shape the upstream judge/eval configs use
//! (a `Default` impl with sane fallbacks, fully overridable by the embedder).

use std::time::Duration;

/// Retry/backoff policy, see [`crate::retry::RetryController`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_fraction: f64,
    pub per_attempt_timeout: Duration,
    pub overall_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            per_attempt_timeout: Duration::from_secs(120),
            overall_deadline: Duration::from_secs(60 * 60),
        }
    }
}

/// Cache sizing/eviction/invalidation policy, see [`crate::cache::ResultCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_age: Duration,
    pub min_confidence: f64,
    pub persistence_path: Option<std::path::PathBuf>,
    pub tracked_extensions: Vec<String>,
    pub max_fingerprint_files: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_age: Duration::from_secs(24 * 60 * 60),
            min_confidence: 0.7,
            persistence_path: None,
            tracked_extensions: [
                "rs", "toml", "ts", "tsx", "js", "jsx", "py", "go", "java", "json", "md",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_fingerprint_files: 50,
        }
    }
}

/// Process-wide concurrency cap, see §5 of the spec (semaphore over expert invocations).
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_concurrent_invocations: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: num_cpus() * 2,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Bundles the above plus the cost-rate constant left open by the spec's
/// Open Questions (§9): the precise token-cost constants are configuration-driven
/// upstream and not part of the external contract, so we expose and default
/// them conservatively rather than hardcoding them into the scorer.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub concurrency: ConcurrencyConfig,
    /// Estimated USD cost per estimated token, used only for `CacheEntry::estimated_cost`.
    pub cost_per_token: f64,
    /// Upper bound (in Unicode code points) on the synthesized final text — the
    /// spec leaves this unbounded in principle but flags it as needing a bound
    /// in practice (§9 Open Questions); we pick a generous but finite default.
    pub max_synthesis_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            cost_per_token: 0.000_003,
            max_synthesis_chars: 20_000,
        }
    }
}
