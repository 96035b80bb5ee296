//! Bounded reconnect backoff.

use std::time::Duration;

/// Default reconnect delays, in seconds.
pub const DEFAULT_RECONNECT_DELAYS_SECS: [f64; 12] =
    [0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 8.0, 10.0, 15.0, 30.0, 60.0];

/// Ordered retry delays, clamped to the last entry once exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Build from delays in seconds; negative or non-finite entries become zero.
    pub fn from_secs(delays: &[f64]) -> Self {
        Self::new(
            delays
                .iter()
                .map(|secs| Duration::try_from_secs_f64(*secs).unwrap_or(Duration::ZERO))
                .collect(),
        )
    }

    /// The same delay for every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(vec![delay])
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self.delays.len() {
            0 => Duration::ZERO,
            len => self.delays[attempt.min(len - 1)],
        }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_RECONNECT_DELAYS_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_five_element_sequence_clamps() {
        let secs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let backoff = Backoff::from_secs(&secs);
        for (attempt, expected) in secs.iter().enumerate() {
            assert_eq!(backoff.delay(attempt), Duration::from_secs_f64(*expected));
        }
        assert_eq!(backoff.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_default_sequence() {
        let backoff = Backoff::default();
        assert_eq!(backoff.len(), 12);
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(750));
        assert_eq!(backoff.delay(100), Duration::from_secs(60));
    }

    #[test]
    fn test_empty_sequence_is_zero() {
        let backoff = Backoff::new(Vec::new());
        assert!(backoff.is_empty());
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }

    #[test]
    fn test_invalid_seconds_become_zero() {
        let backoff = Backoff::from_secs(&[-1.0, f64::NAN]);
        assert_eq!(backoff.delays(), &[Duration::ZERO, Duration::ZERO]);
    }

    proptest! {
        #[test]
        fn prop_delay_clamps_to_last(
            millis in prop::collection::vec(0u64..10_000, 1..20),
            attempt in 0usize..1000,
        ) {
            let delays: Vec<Duration> = millis.iter().copied().map(Duration::from_millis).collect();
            let backoff = Backoff::new(delays.clone());
            let expected = delays[attempt.min(delays.len() - 1)];
            prop_assert_eq!(backoff.delay(attempt), expected);
        }
    }
}
