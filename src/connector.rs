//! Bounded-retry client bootstrap.
//!
//! Freshly spawned services accept connections some time after their process
//! exists; the listener may not be bound when the harness first reaches for
//! it. [`RetryingConnector`] absorbs that race with a short, bounded retry
//! around whatever builds the client. The attempt closure may also probe the
//! new client with a cheap call so that success means "accepting
//! application-level requests", not merely "port open".

use std::future::Future;
use std::time::Duration;

use eyre::eyre;
use tokio::time::sleep;
use tracing::debug;

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy)]
pub struct RetryingConnector {
    max_attempts: u32,
    retry_delay: Duration,
}

impl RetryingConnector {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// Runs `attempt` until it yields a client, waiting `retry_delay` between
    /// failures, for at most `max_attempts` tries. Exhaustion surfaces
    /// [`HarnessError::ConnectFailed`] wrapping the final underlying error.
    ///
    /// `address` is diagnostic only; the attempt closure owns the actual
    /// endpoint construction.
    pub async fn connect<T, F, Fut>(&self, address: &str, mut attempt: F) -> Result<T, HarnessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        let mut last_error = None;

        for n in 1..=self.max_attempts {
            match attempt().await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    debug!("connect attempt {n}/{} to {address}: {err:#}", self.max_attempts);
                    last_error = Some(err);
                }
            }
            if n < self.max_attempts {
                sleep(self.retry_delay).await;
            }
        }

        Err(HarnessError::ConnectFailed {
            address: address.to_string(),
            attempts: self.max_attempts,
            cause: last_error.unwrap_or_else(|| eyre!("no connection attempts were made")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn stops_after_max_attempts_and_wraps_last_error() {
        let connector = RetryingConnector::new(5, Duration::from_millis(10));
        let mut attempts = 0u32;

        let err = connector
            .connect::<u8, _, _>("localhost:9", || {
                attempts += 1;
                let report = eyre!("refused (attempt {attempts})");
                async move { Err(report) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts, 5);
        match err {
            HarnessError::ConnectFailed {
                attempts, cause, ..
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(cause.to_string(), "refused (attempt 5)");
            }
            other => panic!("expected ConnectFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn returns_client_once_an_attempt_succeeds() {
        let connector = RetryingConnector::new(5, Duration::from_millis(5));
        let mut attempts = 0u32;

        let client = connector
            .connect("localhost:9", || {
                attempts += 1;
                let outcome = if attempts < 3 {
                    Err(eyre!("listener not bound"))
                } else {
                    Ok(42u32)
                };
                async move { outcome }
            })
            .await
            .unwrap();

        assert_eq!(client, 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn waits_the_fixed_delay_between_attempts() {
        let delay = Duration::from_millis(40);
        let connector = RetryingConnector::new(3, delay);
        let started = Instant::now();

        let _ = connector
            .connect::<(), _, _>("localhost:9", || async { Err(eyre!("down")) })
            .await
            .unwrap_err();

        // Two sleeps separate three attempts; none trails the last one.
        assert!(started.elapsed() >= 2 * delay);
    }
}
