//! Fixed-interval polling used by every wait in the cookbooks.
//!
//! All waits (cluster health, rebalance, node drain, node readiness) share the
//! same loop: probe, and if the probe is not ready yet sleep for the poll
//! interval and probe again, until the timeout elapses. Sleeping goes through
//! the tokio timer, so tests drive these loops with a paused clock.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// How long to keep polling and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSchedule {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSchedule {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub const fn from_secs(timeout_secs: u64, interval_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(interval_secs),
        )
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::from_secs(600, 10)
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T, S> {
    /// The condition holds, stop polling.
    Ready(T),
    /// Not there yet; carries what was observed so a timeout can report it.
    Pending(S),
}

#[derive(Debug, Error)]
pub enum PollError<S, E> {
    #[error("timed out after {waited:?} ({attempts} attempts)")]
    TimedOut {
        waited: Duration,
        attempts: u32,
        last: Option<S>,
    },
    #[error("probe failed: {0}")]
    Probe(E),
}

/// Polls `probe` until it reports [`Probe::Ready`] or the schedule times out.
///
/// The probe receives the 1-based attempt number. Probe errors abort the wait
/// immediately.
pub async fn poll_until<T, S, E, F, Fut>(
    schedule: PollSchedule,
    mut probe: F,
) -> Result<T, PollError<S, E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Probe<T, S>, E>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last = None;

    while start.elapsed() < schedule.timeout {
        attempts += 1;
        match probe(attempts).await.map_err(PollError::Probe)? {
            Probe::Ready(value) => return Ok(value),
            Probe::Pending(observed) => last = Some(observed),
        }

        let remaining = schedule.timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(schedule.interval.min(remaining)).await;
    }

    Err(PollError::TimedOut {
        waited: start.elapsed(),
        attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_ready_check() {
        let schedule = PollSchedule::from_secs(60, 10);
        let result: Result<u32, PollError<(), Infallible>> =
            poll_until(schedule, |attempt| async move { Ok(Probe::Ready(attempt)) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_ready() {
        let schedule = PollSchedule::from_secs(60, 10);
        let start = Instant::now();
        let result: Result<u32, PollError<u32, Infallible>> = poll_until(schedule, |attempt| async move {
            if attempt < 4 {
                Ok(Probe::Pending(attempt))
            } else {
                Ok(Probe::Ready(attempt))
            }
        })
        .await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_last_observation() {
        let schedule = PollSchedule::from_secs(60, 10);
        let start = Instant::now();
        let result: Result<(), PollError<u32, Infallible>> =
            poll_until(schedule, |attempt| async move { Ok(Probe::Pending(attempt)) }).await;

        match result {
            Err(PollError::TimedOut { waited, attempts, last }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last, Some(6));
                assert!(waited >= Duration::from_secs(60));
                assert!(waited < Duration::from_secs(70));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_sleep_is_clamped_to_timeout() {
        let schedule = PollSchedule::from_secs(25, 10);
        let start = Instant::now();
        let result: Result<(), PollError<(), Infallible>> =
            poll_until(schedule, |_| async { Ok(Probe::Pending(())) }).await;
        assert!(matches!(result, Err(PollError::TimedOut { attempts: 3, .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_aborts() {
        let schedule = PollSchedule::from_secs(60, 10);
        let result: Result<(), PollError<(), String>> =
            poll_until(schedule, |_| async { Err("boom".to_string()) }).await;
        assert!(matches!(result, Err(PollError::Probe(ref e)) if e == "boom"));
    }
}
