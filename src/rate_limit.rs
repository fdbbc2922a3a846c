//! In-process sliding-window rate limiting keyed by string.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const LOCK_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The history could not be locked in time; callers should treat the request as limited.
    #[error("Deadlock trying to incr_ratelimit for {0}")]
    Locked(String),
}

/// Applies every `(window, max)` rule; a request is admitted only if all rules allow it.
pub struct SlidingWindowLimiter {
    rules: Vec<(Duration, usize)>,
    clock: Arc<dyn Clock>,
    history: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(rules: Vec<(Duration, usize)>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules,
            clock,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Records a request for `key` if it is within limits.
    pub fn check_and_record(&self, key: &str) -> Result<RateLimitDecision, RateLimitError> {
        let now = self.clock.now();
        let mut history = self
            .history
            .try_lock_for(LOCK_WAIT)
            .ok_or_else(|| RateLimitError::Locked(key.to_string()))?;
        let events = history.entry(key.to_string()).or_default();

        let longest = self.rules.iter().map(|(window, _)| *window).max().unwrap_or_default();
        let horizon = window_start(now, longest);
        while events.front().is_some_and(|t| *t <= horizon) {
            events.pop_front();
        }

        for (window, max) in &self.rules {
            let since = window_start(now, *window);
            let in_window: Vec<_> = events.iter().filter(|t| **t > since).collect();
            if in_window.len() >= *max {
                let retry_after = in_window
                    .first()
                    .and_then(|oldest| oldest.checked_add_signed(to_chrono(*window)))
                    .and_then(|reopens| (reopens - now).to_std().ok())
                    .unwrap_or_default();
                return Ok(RateLimitDecision::Limited { retry_after });
            }
        }

        events.push_back(now);
        Ok(RateLimitDecision::Allowed)
    }

    /// Forgets all recorded requests for `key`.
    pub fn clear_history(&self, key: &str) {
        self.history.lock().remove(key);
    }

    #[cfg(test)]
    pub(crate) fn hold_lock_until<F: FnOnce()>(&self, f: F) {
        let _guard = self.history.lock();
        f();
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::MAX)
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn limiter(clock: Arc<ManualClock>) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(vec![(Duration::from_secs(10), 2)], clock)
    }

    #[test]
    fn test_requests_beyond_the_rule_are_limited_until_the_window_passes() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()));
        let limiter = limiter(clock.clone());

        assert_eq!(limiter.check_and_record("realm:zulip"), Ok(RateLimitDecision::Allowed));
        assert_eq!(limiter.check_and_record("realm:zulip"), Ok(RateLimitDecision::Allowed));
        assert_eq!(
            limiter.check_and_record("realm:zulip"),
            Ok(RateLimitDecision::Limited { retry_after: Duration::from_secs(10) })
        );
        assert_eq!(limiter.check_and_record("realm:other"), Ok(RateLimitDecision::Allowed));

        clock.advance(Duration::from_secs(11));
        assert_eq!(limiter.check_and_record("realm:zulip"), Ok(RateLimitDecision::Allowed));
    }

    #[test]
    fn test_clear_history_resets_the_key() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()));
        let limiter = limiter(clock);
        limiter.check_and_record("k").unwrap();
        limiter.check_and_record("k").unwrap();

        limiter.clear_history("k");
        assert_eq!(limiter.check_and_record("k"), Ok(RateLimitDecision::Allowed));
    }

    #[test]
    fn test_lock_contention_is_reported() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()));
        let limiter = limiter(clock);

        let _guard = limiter.history.lock();
        assert_eq!(
            limiter.check_and_record("RateLimitedRealmMirror:zulip"),
            Err(RateLimitError::Locked("RateLimitedRealmMirror:zulip".to_string()))
        );
    }
}
