//! Reconnection backoff.

use std::time::Duration;

use tracing::debug;

/// Delay before reconnection attempt `attempt + 1`: `min(2^attempt, cap)` seconds.
pub fn backoff_delay(attempt: u32, cap_secs: u64) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX).min(cap_secs);
    Duration::from_secs(secs)
}

/// Tracks attempts against one peer.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    cap_secs: u64,
}

impl Backoff {
    pub fn new(max_attempts: u32, cap_secs: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            cap_secs,
        }
    }

    /// Delay to wait after the attempt just made, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = backoff_delay(self.attempt, self.cap_secs);
        self.attempt += 1;
        debug!(attempt = self.attempt, delay = ?delay, "backing off");
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let delays: Vec<u64> = (0..8).map(|n| backoff_delay(n, 32).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
        assert_eq!(backoff_delay(200, 32), Duration::from_secs(32));
    }

    #[test]
    fn budget_is_bounded() {
        let mut backoff = Backoff::new(10, 32);
        let mut total = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            total += delay;
        }
        assert_eq!(backoff.attempts(), 10);
        assert!(backoff.exhausted());
        // 1+2+4+8+16 + 5×32
        assert_eq!(total, Duration::from_secs(191));
    }
}
