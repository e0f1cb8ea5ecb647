//! RetryController — classified retries, exponential backoff with jitter,
//! bounded per-attempt and overall timeouts (§4.B).
//!
//! The backoff/jitter shape mirrors the teacher's Thompson-Sampling sampling
//! style in spirit (draw from a distribution, clamp, report) but jitter here
//! must come from a real RNG rather than a deterministic seed — the spec
//! requires synchronized-retry avoidance across independent clients, so we
//! use `rand::thread_rng()` the way the teacher's `ThompsonSelector` does for
//! its epsilon-greedy shuffling.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::error::{ClassifiedError, RetryAttempt, RetryExhausted};
use crate::types::RetryStats;

/// Nominal (pre-jitter) delay before the given attempt number (1-indexed is
/// attempt *about to be retried*, so `attempt=1` is the delay before the
/// second try).
pub fn nominal_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = policy.initial_delay.as_secs_f64() * policy.backoff_multiplier.powi(attempt as i32 - 1);
    let capped = raw.min(policy.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped.max(0.0))
}

/// Apply uniform jitter in `[-jitterFraction/2, +jitterFraction/2] * delay`,
/// clamped to `>= 0`.
fn jittered_delay(base: Duration, jitter_fraction: f64, rng: &mut impl Rng) -> Duration {
    let frac = rng.gen_range(-jitter_fraction / 2.0..=jitter_fraction / 2.0);
    let secs = (base.as_secs_f64() * (1.0 + frac)).max(0.0);
    Duration::from_secs_f64(secs)
}

fn delay_for_attempt(policy: &RetryPolicy, attempt: u32, error: &ClassifiedError) -> Duration {
    let base = nominal_delay(policy, attempt);
    let mut rng = rand::thread_rng();
    let jittered = jittered_delay(base, policy.jitter_fraction, &mut rng);
    // RateLimit is always retried, with at least max(backoff, suggestedDelay).
    match error.retry_after() {
        Some(suggested) => jittered.max(suggested),
        None => jittered,
    }
}

/// Atomically-updated counters shared across concurrent invocations.
#[derive(Debug, Default)]
pub struct RetryCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    total_retries: AtomicU64,
    by_kind: Mutex<std::collections::HashMap<String, u64>>,
}

impl RetryCounters {
    pub async fn snapshot(&self) -> RetryStats {
        let by_kind = self.by_kind.lock().await.clone();
        RetryStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retries_by_error_kind: by_kind,
            total_retries: self.total_retries.load(Ordering::Relaxed),
        }
    }

    async fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    async fn record_retry(&self, kind: &str) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        let mut map = self.by_kind.lock().await;
        *map.entry(kind.to_string()).or_insert(0) += 1;
    }

    async fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wraps an async operation with classified retry/backoff/timeout behaviour.
pub struct RetryController {
    counters: RetryCounters,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryController {
    pub fn new() -> Self {
        Self {
            counters: RetryCounters::default(),
        }
    }

    pub async fn stats(&self) -> RetryStats {
        self.counters.snapshot().await
    }

    /// `op` is retried up to `policy.max_retries` additional times after the
    /// first attempt, subject to `overall_deadline`. Each attempt is itself
    /// bounded by `per_attempt_timeout`; a timeout is classified as
    /// `ClassifiedError::Timeout`.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let start = Instant::now();
        let mut history: Vec<RetryAttempt> = Vec::new();

        for attempt in 1..=(policy.max_retries + 1) {
            self.counters.record_attempt().await;

            if start.elapsed() >= policy.overall_deadline {
                history.push(RetryAttempt {
                    attempt,
                    error: ClassifiedError::Timeout(start.elapsed()),
                    delay_before_next: None,
                });
                tracing::error!(attempt, "retry controller: overall deadline exceeded");
                return Err(RetryExhausted { history });
            }

            let attempt_result = match tokio::time::timeout(policy.per_attempt_timeout, op()).await
            {
                Ok(inner) => inner,
                Err(_) => Err(ClassifiedError::Timeout(policy.per_attempt_timeout)),
            };

            match attempt_result {
                Ok(value) => {
                    self.counters.record_success().await;
                    tracing::debug!(attempt, "retry controller: attempt succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    let retriable = err.is_retriable();
                    let is_last = attempt == policy.max_retries + 1;

                    if !retriable || is_last {
                        history.push(RetryAttempt {
                            attempt,
                            error: err.clone(),
                            delay_before_next: None,
                        });
                        tracing::error!(attempt, kind = err.kind_name(), "retry controller: giving up");
                        return Err(RetryExhausted { history });
                    }

                    let delay = delay_for_attempt(policy, attempt, &err);
                    self.counters.record_retry(err.kind_name()).await;
                    tracing::warn!(
                        attempt,
                        kind = err.kind_name(),
                        delay_ms = delay.as_millis() as u64,
                        "retry controller: scheduling retry"
                    );
                    history.push(RetryAttempt {
                        attempt,
                        error: err,
                        delay_before_next: Some(delay),
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Unreachable: the loop always returns within max_retries + 1 iterations.
        Err(RetryExhausted { history })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn nominal_delay_is_monotone_then_capped() {
        let policy = RetryPolicy {
            max_retries: 6,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.0,
            ..Default::default()
        };
        let delays: Vec<Duration> = (1..=6).map(|a| nominal_delay(&policy, a)).collect();
        for w in delays.windows(2) {
            assert!(w[1] >= w[0], "{:?} should be non-decreasing", delays);
        }
        assert_eq!(delays.last().unwrap(), &policy.max_delay);
    }

    #[test]
    fn jitter_distribution_has_width_and_distinct_values() {
        let policy = RetryPolicy {
            jitter_fraction: 0.2,
            initial_delay: Duration::from_millis(1000),
            ..Default::default()
        };
        let base = nominal_delay(&policy, 1);
        let mut rng = rand::thread_rng();
        let samples: Vec<Duration> = (0..500)
            .map(|_| jittered_delay(base, policy.jitter_fraction, &mut rng))
            .collect();

        let min = samples.iter().min().unwrap();
        let max = samples.iter().max().unwrap();
        let theoretical_range = base.as_secs_f64() * policy.jitter_fraction;
        let observed_range = max.as_secs_f64() - min.as_secs_f64();
        assert!(
            observed_range >= 0.5 * theoretical_range,
            "observed {observed_range} vs theoretical {theoretical_range}"
        );

        let distinct: std::collections::HashSet<u128> =
            samples.iter().map(|d| d.as_nanos()).collect();
        assert!(distinct.len() > 1);

        for s in &samples {
            let lower = base.as_secs_f64() * (1.0 - policy.jitter_fraction / 2.0);
            let upper = base.as_secs_f64() * (1.0 + policy.jitter_fraction / 2.0);
            let s = s.as_secs_f64();
            assert!(s >= lower - 1e-9 && s <= upper + 1e-9);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let controller = RetryController::new();
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_fraction: 0.0,
            ..Default::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = controller
            .execute(&policy, move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ClassifiedError::Network("connection reset".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = controller.stats().await;
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.total_retries, 2);
    }

    #[tokio::test]
    async fn non_retriable_fails_immediately() {
        let controller = RetryController::new();
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = controller
            .execute(&policy, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ClassifiedError::Auth("bad key".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_carries_full_history() {
        let controller = RetryController::new();
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_fraction: 0.0,
            ..Default::default()
        };

        let result: Result<(), _> = controller
            .execute(&policy, || async {
                Err(ClassifiedError::Network("down".to_string()))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.history.len(), 3);
    }
}
