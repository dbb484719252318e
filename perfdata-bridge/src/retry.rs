//! Capped exponential back-off for store calls that fail to connect.

use std::future::Future;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::store::StoreError;

/// Back-off schedule: the wait doubles after each attempt, capped at
/// `max_wait`, and stops after `max_attempts` retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_wait: Duration,
    max_attempts: u32,
    current_wait: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(init_wait: Duration, max_wait: Duration, max_attempts: u32) -> Self {
        Self {
            max_wait,
            max_attempts,
            current_wait: init_wait,
            attempts: 0,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            Duration::from_millis(config.connect_retry_initial_ms),
            Duration::from_secs(config.connect_retry_max_secs),
            config.connect_retry_attempts,
        )
    }

    /// Next wait, or `None` once every retry has been used.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let wait = self.current_wait.min(self.max_wait);
        self.current_wait = (self.current_wait * 2).min(self.max_wait);
        self.attempts += 1;
        Some(wait)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Runs `op` until it succeeds or fails with anything but a connection failure.
///
/// Connection failures are retried following `backoff`; once it is exhausted
/// the last error is returned.
pub async fn retry_on_connect<T, F, Fut>(
    what: &str,
    mut backoff: ExponentialBackoff,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    loop {
        match op().await {
            Err(err) if err.is_connect_failure() => match backoff.next_wait() {
                Some(wait) => {
                    tracing::info!(
                        operation = what,
                        attempt = backoff.attempts(),
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "store unreachable, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                None => return Err(err),
            },
            other => return other,
        }
    }
}
