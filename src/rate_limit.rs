//! Per-session token bucket.
//!
//! Credit accrues continuously in proportion to elapsed time and is capped
//! at one second's worth of budget, so an idle client cannot bank an
//! unbounded burst. A fresh limiter starts empty: reconnecting does not
//! grant a free burst.
//!
//! The limiter is owned by exactly one session task and is not shared.

use std::time::{Duration, Instant};

/// Token bucket throttle measured in units per second.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Refill rate in units per second.
    budget: f64,
    /// Currently banked units, at most `budget`.
    allowance: f64,
    /// Time of the last refill.
    last_refill: Instant,
}

impl RateLimiter {
    /// Create an empty limiter with the given budget.
    #[must_use]
    pub fn new(budget: f64) -> Self {
        Self::new_at(budget, Instant::now())
    }

    /// Create an empty limiter anchored at `now`.
    #[must_use]
    pub fn new_at(budget: f64, now: Instant) -> Self {
        Self {
            budget: budget.max(f64::MIN_POSITIVE),
            allowance: 0.0,
            last_refill: now,
        }
    }

    /// Current budget in units per second.
    pub fn budget(&self) -> f64 {
        self.budget
    }

    /// Currently banked units.
    pub fn allowance(&self) -> f64 {
        self.allowance
    }

    /// Switch to a new budget, keeping banked credit up to the new cap.
    pub fn set_budget(&mut self, budget: f64) {
        self.budget = budget.max(f64::MIN_POSITIVE);
        self.allowance = self.allowance.min(self.budget);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.allowance = (self.allowance + elapsed * self.budget).min(self.budget);
    }

    /// Consume one unit if available (non-blocking).
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.allowance >= 1.0 {
            self.allowance -= 1.0;
            true
        } else {
            false
        }
    }

    /// Reserve `n` units and return how long the caller must wait before
    /// using them.
    ///
    /// The reservation is taken immediately, so the allowance may go
    /// negative; later calls then wait for the debt to be repaid. This keeps
    /// ordering strict for a single consumer.
    pub fn reserve_at(&mut self, n: f64, now: Instant) -> Duration {
        self.refill(now);
        self.allowance -= n;
        if self.allowance >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.allowance / self.budget)
        }
    }

    /// Wait until `n` units are available, then consume them.
    pub async fn wait_for(&mut self, n: f64) {
        let delay = self.reserve_at(n, Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_empty() {
        let now = Instant::now();
        let mut rl = RateLimiter::new_at(10.0, now);
        assert!(!rl.allow_at(now));
    }

    #[test]
    fn test_refill_is_proportional_to_elapsed_time() {
        let t0 = Instant::now();
        let mut rl = RateLimiter::new_at(10.0, t0);
        let t1 = t0 + Duration::from_millis(300);
        assert!(rl.allow_at(t1));
        assert!(rl.allow_at(t1));
        assert!(rl.allow_at(t1));
        assert!(!rl.allow_at(t1));
    }

    #[test]
    fn test_allowance_capped_at_one_second() {
        let t0 = Instant::now();
        let mut rl = RateLimiter::new_at(5.0, t0);
        let later = t0 + Duration::from_secs(3600);
        let granted = (0..100).filter(|_| rl.allow_at(later)).count();
        assert_eq!(granted, 5);
    }

    #[test]
    fn test_reserve_paces_a_burst() {
        let t0 = Instant::now();
        let mut rl = RateLimiter::new_at(100.0, t0);
        // Empty bucket: each reservation pushes the wait out by 10ms.
        let mut last = Duration::ZERO;
        for i in 1..=50u32 {
            let wait = rl.reserve_at(1.0, t0);
            assert!(wait > last, "reservation {i} must wait longer");
            last = wait;
        }
        // 50 units at 100/s need half a second in total.
        assert!((last.as_secs_f64() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_processed_rate_never_exceeds_budget() {
        let t0 = Instant::now();
        let budget = 200.0;
        let mut rl = RateLimiter::new_at(budget, t0);
        let mut clock = t0;
        let mut starts = Vec::new();
        for _ in 0..1000 {
            clock += rl.reserve_at(1.0, clock);
            starts.push(clock);
        }
        // Any one-second window holds at most budget + the 1s bank.
        for (i, start) in starts.iter().enumerate() {
            let end = *start + Duration::from_secs(1);
            let in_window = starts[i..].iter().take_while(|t| **t < end).count();
            assert!(in_window as f64 <= budget * 1.01 + 1.0, "window had {in_window}");
        }
    }

    #[test]
    fn test_set_budget_reclamps_allowance() {
        let t0 = Instant::now();
        let mut rl = RateLimiter::new_at(1000.0, t0);
        rl.refill(t0 + Duration::from_secs(2));
        assert!((rl.allowance() - 1000.0).abs() < f64::EPSILON);
        rl.set_budget(10.0);
        assert!((rl.budget() - 10.0).abs() < f64::EPSILON);
        assert!((rl.allowance() - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_wait_for_sleeps_when_empty() {
        let mut rl = RateLimiter::new(100.0);
        let start = Instant::now();
        rl.wait_for(5.0).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
