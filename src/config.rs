//! Node configuration and retry policy.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::dht::DEFAULT_VALUE_TTL;
use crate::rpc::DEFAULT_RPC_TIMEOUT;

/// Default Kademlia replication parameter.
pub const DEFAULT_K: usize = 20;

/// Default Kademlia concurrency factor (parallel queries per round).
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket capacity and replication factor.
    pub k: usize,
    pub alpha: usize,
    pub rpc_timeout: Duration,
    /// Hard bound on crawl rounds.
    pub max_lookup_rounds: usize,
    /// Hard bound on a whole crawl.
    pub lookup_timeout: Duration,
    pub value_ttl: Duration,
    pub bucket_refresh_interval: Duration,
    pub republish_interval: Duration,
    /// Apply writes locally when no neighbors are known.
    pub authoritative: bool,
    /// Backoff used when pinging bootstrap seeds.
    pub bootstrap_retry: RetryPolicy,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            max_lookup_rounds: 20,
            lookup_timeout: Duration::from_secs(30),
            value_ttl: DEFAULT_VALUE_TTL,
            bucket_refresh_interval: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            authoritative: false,
            bootstrap_retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff with a cap.
///
/// Attempt numbers start at 1; the delay before attempt `n + 1` is
/// `base_delay * multiplier^(n - 1)`, clamped to `max_delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// SSDP search backoff: 0.2s growing by 1.5x up to ten minutes, unbounded attempts.
    pub fn discovery() -> Self {
        Self {
            max_attempts: usize::MAX,
            base_delay: Duration::from_millis(200),
            multiplier: 1.5,
            max_delay: Duration::from_secs(600),
        }
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Run `op` until it returns `Some`, sleeping between attempts.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let mut attempt = 1;
        loop {
            if let Some(out) = op(attempt).await {
                return Some(out);
            }
            if attempt >= self.max_attempts {
                return None;
            }
            let delay = self.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
