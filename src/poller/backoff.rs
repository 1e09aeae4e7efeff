// src/poller/backoff.rs
//! Retry delays for a failing store
//!
//! Doubling delays from `initial`, capped at `max`, each jittered down to a
//! random fraction of itself.

use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

/// Infinite iterator of retry delays; build a fresh one to start over
pub type RetryDelays = std::iter::Map<ExponentialBackoff, fn(Duration) -> Duration>;

pub fn retry_delays(initial: Duration, max: Duration) -> RetryDelays {
    // ExponentialBackoff yields factor * 2^n for n = 1, 2, ...
    let factor = (initial.as_millis() as u64 / 2).max(1);
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(max)
        .map(jitter as fn(Duration) -> Duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let delays: Vec<Duration> =
            retry_delays(Duration::from_millis(100), Duration::from_millis(400))
                .take(6)
                .collect();

        let bounds = [100, 200, 400, 400, 400, 400];
        for (delay, upper) in delays.iter().zip(bounds) {
            assert!(*delay <= Duration::from_millis(upper), "{:?} > {}ms", delay, upper);
        }
    }

    #[test]
    fn test_never_runs_dry() {
        let mut delays = retry_delays(Duration::from_millis(10), Duration::from_secs(1));
        for _ in 0..1_000 {
            assert!(delays.next().unwrap() <= Duration::from_secs(1));
        }
    }
}
