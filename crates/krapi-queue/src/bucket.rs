//! Token bucket used to rate-limit admissions.

use std::time::Instant;

/// A token bucket holding at most `capacity` tokens, refilled continuously
/// at `rate_per_sec`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket whose capacity equals one second of refill.
    pub fn new(rate_per_sec: u32, now: Instant) -> Self {
        let rate = f64::from(rate_per_sec);
        Self {
            capacity: rate,
            tokens: rate,
            rate_per_sec: rate,
            last_refill: now,
        }
    }

    /// Adds tokens for the time elapsed since the last refill, capped at the
    /// capacity. A clock reading earlier than the last refill adds nothing.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Refills, then takes one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, without refilling.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_full_and_drains_one_per_take() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3, start);
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start), "fourth take within the instant fails");
    }

    #[test]
    fn rate_plus_one_waits_for_refill() {
        let rate = 10;
        let start = Instant::now();
        let mut bucket = TokenBucket::new(rate, start);

        let admitted = (0..=rate).filter(|_| bucket.try_take(start)).count();
        assert_eq!(admitted, rate as usize, "at most R admissions up front");

        // Less than one token's worth of time later: still nothing.
        assert!(!bucket.try_take(start + Duration::from_millis(50)));
        // One refill interval later the next operation is admitted.
        assert!(bucket.try_take(start + Duration::from_millis(100)));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(5, start);
        bucket.refill(start + Duration::from_secs(60));
        assert_eq!(bucket.available(), bucket.capacity());
    }

    #[test]
    fn earlier_clock_reading_adds_nothing() {
        let start = Instant::now() + Duration::from_secs(1);
        let mut bucket = TokenBucket::new(2, start);
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        bucket.refill(start - Duration::from_millis(500));
        assert_eq!(bucket.available(), 0.0);
    }
}
