//! The synchronization primitive every scenario assertion funnels through.
//!
//! The driven services are eventually consistent: blocks must be mined,
//! channels must confirm, balances settle over several commitment updates.
//! [`wait_until`] absorbs that by re-evaluating a predicate at a fixed
//! interval until it reports true or the deadline is spent. Errors raised by
//! the predicate are expected noise during convergence (a channel not yet
//! visible, a node still syncing) and are retried, not propagated; only the
//! last one is kept for diagnostics.
//!
//! The interval is fixed rather than exponential: the awaited conditions
//! advance in discrete, externally paced steps (one mined block, one
//! settled payment), so growing the backoff only slows detection.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::HarnessError;

/// Repeatedly evaluates `condition` until it returns `Ok(true)` or the
/// attempt budget (`timeout / poll_interval`, at least one) is spent.
///
/// Predicates are free to have side effects (several scenario conditions
/// mine a block per attempt) and are never assumed idempotent. A predicate
/// that returns `Ok(true)` on the first attempt is invoked exactly once and
/// the caller never sleeps.
pub async fn wait_until<F, Fut>(
    label: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut condition: F,
) -> Result<(), HarnessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = eyre::Result<bool>>,
{
    info!("waiting for {label}");

    let interval_ms = poll_interval.as_millis().max(1);
    let attempts = (timeout.as_millis() / interval_ms).max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match condition().await {
            Ok(true) => {
                debug!("done {label} (attempt {attempt})");
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => {
                debug!("attempt {attempt} for {label}: {err:#}");
                last_error = Some(err);
            }
        }
        sleep(poll_interval).await;
    }

    Err(HarnessError::PollTimeout {
        label: label.to_string(),
        timeout,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;
    use std::time::Instant;

    #[tokio::test]
    async fn immediate_success_invokes_once_without_sleeping() {
        let mut calls = 0u32;
        let started = Instant::now();

        wait_until(
            "already true",
            Duration::from_secs(10),
            Duration::from_millis(200),
            || {
                calls += 1;
                async { Ok(true) }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn false_forever_times_out_near_the_deadline() {
        let timeout = Duration::from_millis(200);
        let interval = Duration::from_millis(50);
        let started = Instant::now();

        let err = wait_until("never true", timeout, interval, || async { Ok(false) })
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= timeout, "gave up early after {elapsed:?}");
        assert!(
            elapsed < timeout + 2 * interval,
            "kept polling too long: {elapsed:?}"
        );
        match err {
            HarnessError::PollTimeout {
                label, last_error, ..
            } => {
                assert_eq!(label, "never true");
                assert!(last_error.is_none());
            }
            other => panic!("expected PollTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let mut calls = 0u32;

        wait_until(
            "flaky condition",
            Duration::from_secs(5),
            Duration::from_millis(10),
            || {
                calls += 1;
                let outcome = if calls <= 3 {
                    Err(eyre!("not yet visible"))
                } else {
                    Ok(true)
                };
                async move { outcome }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn timeout_surfaces_the_last_predicate_error() {
        let mut calls = 0u32;

        let err = wait_until(
            "always failing",
            Duration::from_millis(100),
            Duration::from_millis(25),
            || {
                calls += 1;
                let report = eyre!("failure #{calls}");
                async move { Err(report) }
            },
        )
        .await
        .unwrap_err();

        match err {
            HarnessError::PollTimeout { last_error, .. } => {
                let report = last_error.expect("last error should be captured");
                assert_eq!(report.to_string(), format!("failure #{calls}"));
            }
            other => panic!("expected PollTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn poller_holds_no_state_across_calls() {
        for _ in 0..2 {
            let mut calls = 0u32;
            wait_until(
                "repeat label",
                Duration::from_millis(100),
                Duration::from_millis(20),
                || {
                    calls += 1;
                    async { Ok(true) }
                },
            )
            .await
            .unwrap();
            assert_eq!(calls, 1);
        }
    }
}
