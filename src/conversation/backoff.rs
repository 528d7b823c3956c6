//! Rate-limit backoff
//!
//! Consecutive rate-limit failures grow the wait exponentially (2, 4, 8 … s)
//! up to a cap. A quiet period with no failures resets the count.

use std::time::Duration;

use tokio::time::Instant;

/// Default cap on a single wait
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default quiet period that forgives previous failures
pub const DEFAULT_BACKOFF_RESET: Duration = Duration::from_secs(60);

/// Default ceiling on the tracked failure count
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Outcome of a backoff check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    /// Submissions must be held back
    pub should_wait: bool,
    /// Time left before submitting again
    pub remaining: Duration,
}

impl BackoffDecision {
    const CLEAR: Self = Self {
        should_wait: false,
        remaining: Duration::ZERO,
    };

    /// Remaining wait rounded up to whole seconds, for spoken notices
    #[must_use]
    pub fn remaining_secs(&self) -> u64 {
        let secs = self.remaining.as_secs();
        if self.remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Capped exponential backoff
///
/// Stateless: every answer is derived from the inputs the caller passes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Upper bound on one wait
    pub cap: Duration,
    /// Failure-free interval after which the count resets
    pub reset_after: Duration,
    /// Ceiling on the failure count
    pub max_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            cap: DEFAULT_BACKOFF_CAP,
            reset_after: DEFAULT_BACKOFF_RESET,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

impl BackoffPolicy {
    /// Wait that follows `failures` consecutive rate-limit errors
    #[must_use]
    pub fn wait_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // 2^31 s already exceeds any sane cap
        let exponent = failures.min(31);
        let secs = 1u64 << exponent;
        Duration::from_secs(secs).min(self.cap)
    }

    /// Decide whether a submission at `now` has to wait
    #[must_use]
    pub fn evaluate(
        &self,
        consecutive_failures: u32,
        last_failure: Option<Instant>,
        now: Instant,
    ) -> BackoffDecision {
        let Some(last) = last_failure else {
            return BackoffDecision::CLEAR;
        };
        if consecutive_failures == 0 {
            return BackoffDecision::CLEAR;
        }

        let elapsed = now.saturating_duration_since(last);
        let wait = self.wait_for(consecutive_failures);
        if elapsed >= wait {
            return BackoffDecision::CLEAR;
        }

        BackoffDecision {
            should_wait: true,
            remaining: wait - elapsed,
        }
    }

    /// Whether enough quiet time has passed to forget the failures
    #[must_use]
    pub fn should_reset(&self, last_failure: Option<Instant>, now: Instant) -> bool {
        last_failure.is_some_and(|last| now.saturating_duration_since(last) >= self.reset_after)
    }
}

/// Rate-limit bookkeeping owned by the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// When the backend last refused us
    pub last_failure: Option<Instant>,
    /// Failures since the last quiet period
    pub consecutive_failures: u32,
}

impl RateLimitState {
    /// Forget failures after a long enough quiet period
    pub fn refresh(&mut self, policy: &BackoffPolicy, now: Instant) {
        if policy.should_reset(self.last_failure, now) {
            tracing::debug!(
                failures = self.consecutive_failures,
                "rate limit quiet period elapsed, resetting"
            );
            *self = Self::default();
        }
    }

    /// Record a rate-limit failure and return the wait it imposes
    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: Instant) -> Duration {
        self.refresh(policy, now);
        self.consecutive_failures = (self.consecutive_failures + 1).min(policy.max_failures.max(1));
        self.last_failure = Some(now);
        policy.wait_for(self.consecutive_failures)
    }

    /// Check whether a submission at `now` must be held back
    pub fn check(&mut self, policy: &BackoffPolicy, now: Instant) -> BackoffDecision {
        self.refresh(policy, now);
        policy.evaluate(self.consecutive_failures, self.last_failure, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failures_double() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.wait_for(0), Duration::ZERO);
        assert_eq!(policy.wait_for(1), Duration::from_secs(2));
        assert_eq!(policy.wait_for(2), Duration::from_secs(4));
        assert_eq!(policy.wait_for(3), Duration::from_secs(8));
    }

    #[test]
    fn wait_is_monotonic_and_capped() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for failures in 1..=64 {
            let wait = policy.wait_for(failures);
            assert!(wait >= previous, "wait shrank at {failures}");
            assert!(wait <= Duration::from_secs(30));
            previous = wait;
        }
        assert_eq!(policy.wait_for(5), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate_counts_down() {
        let policy = BackoffPolicy::default();
        let start = Instant::now();

        let decision = policy.evaluate(2, Some(start), start + Duration::from_secs(1));
        assert!(decision.should_wait);
        assert_eq!(decision.remaining, Duration::from_secs(3));
        assert_eq!(decision.remaining_secs(), 3);

        let decision = policy.evaluate(2, Some(start), start + Duration::from_secs(4));
        assert!(!decision.should_wait);
        assert_eq!(decision.remaining, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn no_failure_means_no_wait() {
        let policy = BackoffPolicy::default();
        let now = Instant::now();
        assert!(!policy.evaluate(0, Some(now), now).should_wait);
        assert!(!policy.evaluate(3, None, now).should_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn state_accumulates_then_resets_after_quiet_period() {
        let policy = BackoffPolicy::default();
        let mut state = RateLimitState::default();
        let t0 = Instant::now();

        assert_eq!(state.record_failure(&policy, t0), Duration::from_secs(2));
        let t1 = t0 + Duration::from_secs(3);
        assert_eq!(state.record_failure(&policy, t1), Duration::from_secs(4));
        assert_eq!(state.consecutive_failures, 2);

        state.refresh(&policy, t1 + Duration::from_secs(59));
        assert_eq!(state.consecutive_failures, 2);

        state.refresh(&policy, t1 + Duration::from_secs(60));
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_count_is_capped() {
        let policy = BackoffPolicy::default();
        let mut state = RateLimitState::default();
        let mut now = Instant::now();
        for _ in 0..20 {
            state.record_failure(&policy, now);
            now += Duration::from_secs(1);
        }
        assert_eq!(state.consecutive_failures, DEFAULT_MAX_FAILURES);
        assert_eq!(policy.wait_for(state.consecutive_failures), Duration::from_secs(30));
    }

    #[test]
    fn remaining_secs_rounds_up() {
        let decision = BackoffDecision {
            should_wait: true,
            remaining: Duration::from_millis(1_200),
        };
        assert_eq!(decision.remaining_secs(), 2);
    }
}
