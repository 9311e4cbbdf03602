//! Lazy reconnect schedule

use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::config::ReconnectConfig;

/// Exponential schedule of reconnect attempts for one backend.
///
/// Nothing retries in the background: a failure only records when the next
/// attempt is allowed, and the next use of the backend checks it.
pub(crate) struct ReconnectSchedule {
    config: ReconnectConfig,
    backoff: Option<ExponentialBackoff>,
    next_attempt: Option<Instant>,
    failures: u32,
}

impl ReconnectSchedule {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            backoff: None,
            next_attempt: None,
            failures: 0,
        }
    }

    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.initial_backoff)
            .with_max_delay(self.config.max_backoff)
            .with_factor(self.config.multiplier)
            .without_max_times()
    }

    /// Record a failed attempt; returns the wait before the next one
    pub(crate) fn record_failure(&mut self) -> Duration {
        let max = self.config.max_backoff;
        if self.backoff.is_none() {
            self.backoff = Some(self.builder().build());
        }
        let delay = self
            .backoff
            .as_mut()
            .and_then(Iterator::next)
            .unwrap_or(max)
            .min(max);
        self.failures += 1;
        self.next_attempt = Some(Instant::now() + delay);
        delay
    }

    /// Forget failures after a successful connect
    pub(crate) fn reset(&mut self) {
        self.backoff = None;
        self.next_attempt = None;
        self.failures = 0;
    }

    /// Time left before another attempt is allowed
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.next_attempt
            .map(|at| at.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> ReconnectSchedule {
        ReconnectSchedule::new(ReconnectConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
            multiplier: 2.0,
        })
    }

    #[test]
    fn first_failure_waits_initial_backoff() {
        let mut s = schedule();
        assert!(s.remaining().is_none());
        assert_eq!(s.record_failure(), Duration::from_secs(1));
        assert!(s.remaining().is_some());
        assert_eq!(s.failures(), 1);
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut s = schedule();
        let delays: Vec<_> = (0..8).map(|_| s.record_failure()).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(3)));
        assert_eq!(delays[7], Duration::from_secs(3));
    }

    #[test]
    fn reset_clears_schedule() {
        let mut s = schedule();
        s.record_failure();
        s.reset();
        assert!(s.remaining().is_none());
        assert_eq!(s.failures(), 0);
        assert_eq!(s.record_failure(), Duration::from_secs(1));
    }
}
