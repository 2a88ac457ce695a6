// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// A token bucket allowing `rate` operations per second.
///
/// Bursts are capped at `rate` tokens, and never below one token so that
/// rates under one per second still let operations through.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last_update: Instant,
    allowed: u64,
    seen: u64,
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        Self::new_at(rate, Instant::now())
    }

    pub fn new_at(rate: f64, now: Instant) -> Self {
        let burst = if rate > 0.0 { rate.max(1.0) } else { 0.0 };
        Self {
            rate,
            burst,
            state: Mutex::new(State {
                tokens: burst,
                last_update: now,
                allowed: 0,
                seen: 0,
            }),
        }
    }

    /// Consumes a token if one is available.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.seen += 1;
        if self.rate <= 0.0 {
            return false;
        }
        let elapsed = now.saturating_duration_since(state.last_update);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        state.last_update = now;
        if state.tokens < 1.0 {
            return false;
        }
        state.tokens -= 1.0;
        state.allowed += 1;
        true
    }

    /// Share of requests allowed so far, 1 when none was seen.
    pub fn effective_rate(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.seen == 0 {
            return 1.0;
        }
        state.allowed as f64 / state.seen as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_refill() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(2.0, start);
        assert!(limiter.allow_at(start));
        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start));
        assert!(!limiter.allow_at(start + Duration::from_millis(100)));
        assert!(limiter.allow_at(start + Duration::from_millis(600)));
        assert_eq!(limiter.effective_rate(), 3.0 / 5.0);
    }

    #[test]
    fn test_tokens_capped_at_rate() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(1.0, start);
        let later = start + Duration::from_secs(60);
        assert!(limiter.allow_at(later));
        assert!(!limiter.allow_at(later));
    }

    #[test]
    fn test_fractional_rate_allows_some() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(0.5, start);
        let allowed = (0..100)
            .filter(|i| limiter.allow_at(start + Duration::from_secs(*i)))
            .count();
        assert!((49..=51).contains(&allowed), "allowed {allowed}");
        // One token at most, even after a long pause.
        let later = start + Duration::from_secs(1000);
        assert!(limiter.allow_at(later));
        assert!(!limiter.allow_at(later));
    }

    #[test]
    fn test_zero_rate_denies() {
        let limiter = RateLimiter::new(0.0);
        assert!(!limiter.allow());
        assert_eq!(limiter.effective_rate(), 0.0);
    }
}
