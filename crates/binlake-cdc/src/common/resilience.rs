//! Retry policy
//!
//! [`RetryConfig`] bounds how often a transient failure is retried and how
//! long to wait between attempts. The same policy drives three loops:
//! binlog reconnects, snapshot reads and destination loads.
//!
//! ```rust
//! use binlake_cdc::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::builder()
//!     .max_retries(5)
//!     .retry_delay(Duration::from_millis(200))
//!     .max_delay(Duration::from_secs(30))
//!     .jitter(0.0)
//!     .build();
//! assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(1600));
//! assert!(!retry.should_retry(5));
//! ```

use crate::common::CdcError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that know whether another attempt may succeed.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

impl Retriable for CdcError {
    fn is_retriable(&self) -> bool {
        CdcError::is_retriable(self)
    }
}

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; negative retries forever
    max_retries: i32,
    retry_delay: Duration,
    max_delay: Duration,
    /// Fraction of each delay spread around it, 0.0 to 1.0
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder {
            config: Self::default(),
        }
    }

    /// Fail on the first error.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn infinite() -> Self {
        Self {
            max_retries: -1,
            ..Self::default()
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn is_infinite(&self) -> bool {
        self.max_retries < 0
    }

    /// True while `retries` (already made) is inside the budget.
    pub fn should_retry(&self, retries: u32) -> bool {
        match u32::try_from(self.max_retries) {
            Ok(max) => retries < max,
            Err(_) => true,
        }
    }

    /// `retry_delay * 2^retry`, capped at `max_delay`, then spread by the
    /// jitter factor. The spread is a fixed function of `retry` so runs
    /// are reproducible.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let capped = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        // golden-ratio sequence in [-1, 1)
        let spread = ((f64::from(retry) * 0.618_033_988_749_895).fract() * 2.0) - 1.0;
        let secs = capped.as_secs_f64() * (1.0 + self.jitter * spread);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Un-jittered delays for a reconnect loop.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.retry_delay,
            max: self.max_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, retries: i32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Clamped to 0.0..=1.0.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}

/// Doubling delay sequence with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn next_backoff(&mut self) -> Duration {
        let current = self.next.min(self.max);
        self.next = self.next.saturating_mul(2);
        current
    }
}

/// Run `f` until it succeeds, fails with a non-retriable error, or the
/// retry budget is spent. Returns the outcome and the number of attempts made.
pub async fn retry_with_attempts<T, E, F, Fut>(
    config: &RetryConfig,
    op_name: &str,
    mut f: F,
) -> (std::result::Result<T, E>, u32)
where
    E: Retriable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(op = op_name, attempts = attempt + 1, "Succeeded after retry");
                }
                return (Ok(value), attempt + 1);
            }
            Err(e) if e.is_retriable() && config.should_retry(attempt) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retriable failure, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt + 1),
        }
    }
}

/// [`retry_with_attempts`] without the attempt count.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    op_name: &str,
    mut f: F,
) -> std::result::Result<T, E>
where
    E: Retriable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    retry_with_attempts(config, op_name, |_| f()).await.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_budget() {
        let retry = RetryConfig::builder().max_retries(2).build();
        assert!(retry.should_retry(1));
        assert!(!retry.should_retry(2));
        assert!(!RetryConfig::disabled().should_retry(0));
        assert!(RetryConfig::infinite().should_retry(u32::MAX));
        assert!(RetryConfig::builder().max_retries(-5).build().is_infinite());
    }

    #[test]
    fn test_delay_doubles_up_to_the_cap() {
        let retry = RetryConfig::builder()
            .retry_delay(Duration::from_millis(50))
            .max_delay(Duration::from_millis(300))
            .jitter(0.0)
            .build();
        let delays: Vec<_> = (0..5).map(|r| retry.delay_for_attempt(r).as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200, 300, 300]);
    }

    #[test]
    fn test_jitter_stays_within_its_fraction() {
        let retry = RetryConfig::builder()
            .retry_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(600))
            .jitter(0.5)
            .build();
        for r in 0..6 {
            let base = 2.0 * 2f64.powi(r as i32);
            let d = retry.delay_for_attempt(r).as_secs_f64();
            assert!((base * 0.5 - 1e-9..=base * 1.5 + 1e-9).contains(&d), "retry {}: {}", r, d);
        }
        assert_eq!(retry.delay_for_attempt(3), retry.delay_for_attempt(3));
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = RetryConfig::builder()
            .retry_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(25))
            .build()
            .backoff();
        let seq: Vec<_> = (0..4).map(|_| backoff.next_backoff().as_millis()).collect();
        assert_eq!(seq, vec![10, 20, 25, 25]);
    }

    fn fast() -> RetryConfig {
        RetryConfig::builder()
            .max_retries(3)
            .retry_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build()
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_with_attempts(&fast(), "op", |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CdcError::connection_lost("reset"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), CdcError> = retry_with_backoff(&fast(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CdcError::config("bad"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let (result, attempts): (std::result::Result<(), CdcError>, u32) =
            retry_with_attempts(&fast(), "op", |_| async { Err(CdcError::timeout("slow")) }).await;
        assert!(matches!(result, Err(CdcError::Timeout(_))));
        assert_eq!(attempts, 4);
    }
}
