//! Capped exponential backoff for transient store failures.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{MigrateResult, MigrationError};

/// Retry tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Create the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the initial delay.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Reject nonsensical values.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.max_attempts == 0 {
            return Err(MigrationError::invalid_argument(
                "retry max_attempts must be at least 1",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(MigrationError::invalid_argument(
                "retry multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }
}

/// Runs an operation under a [`RetryPolicy`], honoring cancellation
/// during backoff waits.
pub struct Retry<'a> {
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    counter: Option<&'a AtomicU64>,
}

impl<'a> Retry<'a> {
    /// Create a runner.
    pub fn new(policy: &'a RetryPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            counter: None,
        }
    }

    /// Count every retry into the given counter.
    pub fn count_into(mut self, counter: &'a AtomicU64) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> MigrateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MigrateResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    if let Some(counter) = self.counter {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(MigrationError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().max_attempts(0).validate().is_err());
        assert!(RetryPolicy::default().multiplier(0.5).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let retries = AtomicU64::new(0);
        let calls = AtomicU32::new(0);

        let value = Retry::new(&policy, &cancel)
            .count_into(&retries)
            .run("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MigrationError::transient("lock timeout"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default().max_attempts(3);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = Retry::new(&policy, &cancel)
            .run("write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MigrationError::transient("deadlock"))
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = Retry::new(&policy, &cancel)
            .run("write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MigrationError::duplicate_key("23505"))
            })
            .await
            .unwrap_err();

        assert!(err.is_duplicate_key());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy::default().initial_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = Retry::new(&policy, &cancel)
            .run("fetch", || async { Err::<(), _>(MigrationError::transient("timeout")) })
            .await
            .unwrap_err();

        handle.await.unwrap();
        assert!(matches!(err, MigrationError::Cancelled));
    }
}
