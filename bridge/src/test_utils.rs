//! Polling helpers for async dispatcher and daemon tests
//!
//! Tests wait on observable state instead of sleeping for a guessed
//! duration. Every helper panics with the last observation on timeout.

use crate::session::dispatch::Dispatcher;
use crate::session::protocol::DaemonStatus;
use std::fmt::Debug;
use std::future::Future;
use std::time::{Duration, Instant};

const FIRST_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_millis(100);

/// Poll `probe` with backoff until it returns `Ok`.
///
/// `Err` carries the latest observation, reported if `timeout` elapses.
pub async fn eventually<F, Fut, T, O>(desc: &str, timeout: Duration, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, O>>,
    O: Debug,
{
    let start = Instant::now();
    let mut delay = FIRST_DELAY;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let seen = match probe().await {
            Ok(value) => return value,
            Err(seen) => seen,
        };
        if start.elapsed() >= timeout {
            panic!(
                "Timeout waiting for {} after {:?} ({} attempts); last observed: {:?}",
                desc,
                start.elapsed(),
                attempts,
                seen
            );
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

/// Wait until the dispatcher reports `round` in flight, or any round when
/// `round` is `None`
pub async fn until_in_flight(dispatcher: &Dispatcher, round: Option<u64>, timeout: Duration) -> DaemonStatus {
    let desc = match round {
        Some(round) => format!("round {} to be in flight", round),
        None => "a round to be in flight".to_string(),
    };
    eventually(&desc, timeout, move || async move {
        let status = dispatcher.status().await;
        let matched = match round {
            Some(round) => status.in_flight == Some(round),
            None => status.in_flight.is_some(),
        };
        if matched {
            Ok(status)
        } else {
            Err((status.phase, status.in_flight, status.queue_len))
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_eventually_returns_first_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let value = eventually("third call", Duration::from_secs(2), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                Ok(n)
            } else {
                Err(n)
            }
        })
        .await;
        assert_eq!(value, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[should_panic(expected = "Timeout waiting for never ready")]
    async fn test_eventually_reports_last_observation() {
        eventually("never ready", Duration::from_millis(50), || async {
            Err::<(), _>("still starting")
        })
        .await;
    }
}
