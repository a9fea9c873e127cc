//! Bounded retry with exponential backoff for best-effort external calls
//! (notification delivery, analytics writes) and for transaction conflicts.

use crate::utils::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// 在退避時間上加入隨機抖動，避免同時重試
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-indexed), capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32)) as u64;
        let backoff = Duration::from_millis(backoff_ms).min(self.max_backoff);

        if self.jitter && !backoff.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            backoff + Duration::from_millis(jitter_ms)
        } else {
            backoff
        }
    }
}

/// Run `op` until it succeeds or `max_attempts` is reached; the last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < max_attempts => {
                let backoff = config.backoff_for_attempt(attempt);
                tracing::debug!(
                    "🔁 {} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt + 1,
                    max_attempts,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_half_backoff() {
        let config = RetryConfig {
            jitter: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let backoff = config.backoff_for_attempt(0);
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(&fast_config(3), "flaky", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(EngineError::DeliveryError {
                    message: "temporarily unavailable".to_string(),
                })
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = retry_with_backoff(&fast_config(2), "always-fails", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::DeliveryError {
                message: "down".to_string(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
