use std::time::Duration;

/// Capped exponential backoff with unlimited retries
#[derive(Debug)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt; doubles each call up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2_u32.saturating_pow(self.current_attempt);
        let delay = std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay);

        self.current_attempt = self.current_attempt.saturating_add(1);
        log::warn!("⏳ Retry attempt {} in {:?}", self.current_attempt, delay);
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_backoff_never_overflows() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
