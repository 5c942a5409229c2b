//! Support for library configuration options

use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

/// The User-Agent header sent along with upstream fetches.
/// Feel free to override it when initing this library.
pub static USER_AGENT: Lazy<Arc<Mutex<String>>> =
    Lazy::new(|| Arc::new(Mutex::new("ics-pantry".to_string())));

/// Exponential backoff between retries of a failed refresh.
///
/// The delay doubles with every attempt, starting at `base` and never
/// exceeding `cap`. The exact constants are tunables; the guarantee callers
/// can rely on is that the delay is non-decreasing in the attempt count and
/// hard-capped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before the next attempt, given the number of failed
    /// attempts so far (at least 1).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        // 2^32 seconds is way past any sensible cap, no need to shift further
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .base
            .checked_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        delay.min(self.cap)
    }
}

/// What to do with a feed that keeps failing to parse.
///
/// A malformed feed is usually a transient upstream hiccup, but some feeds
/// stay broken forever. Whether to eventually give up on them is a policy
/// choice, so it is configurable rather than hardcoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseErrorPolicy {
    /// Keep retrying forever; the row parks at the backoff cap.
    AlwaysTransient,
    /// Treat the failure as permanent once this many attempts failed.
    PermanentAfter(u32),
}

/// Tunables for the refresh-and-cache machinery.
#[derive(Clone, Debug)]
pub struct RefreshConfig {
    /// Bound on a single upstream fetch. A slow server fails the request
    /// rather than hanging the caller.
    pub fetch_timeout: Duration,
    /// How many fetches for the *same* planning may be in flight at once.
    pub per_planning_fetches: usize,
    pub backoff: BackoffPolicy,
    /// How many queue rows one drain pass claims.
    pub claim_batch_size: usize,
    /// A claim older than this is considered abandoned (worker crash) and
    /// becomes claimable again.
    pub stale_lock_age: Duration,
    /// Priority used when a live request hits a transient failure and wants
    /// its stale cache corrected soon.
    pub enqueue_priority: i64,
    pub parse_error_policy: ParseErrorPolicy,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            per_planning_fetches: 1,
            backoff: BackoffPolicy::default(),
            claim_batch_size: 10,
            stale_lock_age: Duration::from_secs(600),
            enqueue_priority: 10,
            parse_error_policy: ParseErrorPolicy::AlwaysTransient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = BackoffPolicy::default();

        let mut previous = Duration::ZERO;
        for attempts in 1..100 {
            let delay = policy.delay_for(attempts);
            assert!(delay >= previous, "delay shrank at attempt {}", attempts);
            assert!(delay <= policy.cap);
            previous = delay;
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for(8), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(64), Duration::from_secs(3600));
    }
}
