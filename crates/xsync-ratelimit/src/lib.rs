//! Token-bucket rate limiting and retry-with-backoff for the SOR/Grid REST
//! clients (§4.1/§5): a refilling token bucket guarding request cadence,
//! plus exponential backoff with jitter for transient failures.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use xsync_schemas::{EngineError, EngineResult};

/// A token bucket capped at `capacity` tokens, refilling continuously at
/// `capacity` tokens per second. §4.1/§5 default to 5 requests/second per
/// provider.
pub struct RateLimiter {
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let capacity = requests_per_second.max(1) as f64;
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until one token is available, then consumes it. Requests
    /// queue FIFO behind the mutex in arrival order.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.capacity))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.capacity).min(self.capacity);
        state.last_refill = now;
    }
}

/// Baseline retry budget for any retryable error (§4.1).
pub const BASELINE_MAX_ATTEMPTS: u32 = 3;
/// Escalated retry budget once the provider has signalled `RateLimit` at
/// least once during the run (§4.1): rate limits are expected to clear on
/// their own, so a rate-limited call gets more attempts than a bare
/// transient failure would.
pub const RATE_LIMITED_MAX_ATTEMPTS: u32 = 9;

/// Exponential backoff with additive jitter, applied when `EngineError::kind`
/// is retryable (§4.1: `delay = min(base * 2^attempt, 30s) + random(0, 1s)`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: BASELINE_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-indexed attempt: the capped exponential
    /// term plus up to a second of additive jitter, so queued callers don't
    /// all wake in lockstep without ever overshooting the cap by much.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let scaled =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped = Duration::from_millis(scaled as u64).min(self.max_delay);
        capped + jitter()
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::random::<u64>() % 1000)
}

/// Runs `op` under `policy`, retrying retryable `EngineError`s until the
/// attempt budget is exhausted or the error is terminal (§7). The budget
/// starts at `policy.max_attempts` and escalates once to
/// `RATE_LIMITED_MAX_ATTEMPTS` the first time `op` reports `RateLimit`.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    let mut max_attempts = policy.max_attempts;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if matches!(e.kind, xsync_schemas::ErrorKind::RateLimit) {
                    max_attempts = max_attempts.max(RATE_LIMITED_MAX_ATTEMPTS);
                }
                if attempt + 1 >= max_attempts || !e.kind.is_retryable() {
                    return Err(e);
                }
                attempt += 1;
                tracing::warn!(attempt, max_attempts, kind = %e.kind, "retrying after transient failure");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }
}

/// A convenience error for callers that exhaust retries without ever
/// producing a successful `EngineError`-typed attempt (e.g. a closure that
/// panics is out of scope; this covers the all-attempts-failed case).
pub fn retries_exhausted(provider: &str) -> EngineError {
    EngineError::network(format!("retries exhausted for provider {provider}")).with_provider(provider)
}
