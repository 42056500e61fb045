use std::fmt::Display;
use std::time::Duration;

use tracing::{error, warn};

/// Bounded retry configuration shared by every remote-call loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), exponential and capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Fresh failure counter for one retry-protected loop.
    pub fn context(&self, operation: impl Into<String>) -> RetryContext {
        RetryContext::new(operation, self)
    }
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`. `attempt` counts consecutive failures so far.
    Retry { attempt: u32, delay: Duration },
    /// The ceiling was exceeded after `attempts` consecutive failures.
    Abort { attempts: u32 },
}

/// Consecutive-failure counter for a single logical operation.
///
/// Never share one context between unrelated operations; each loop gets its
/// own so failures elsewhere cannot exhaust its budget.
#[derive(Debug, Clone)]
pub struct RetryContext {
    operation: String,
    policy: RetryPolicy,
    failures: u32,
}

impl RetryContext {
    pub fn new(operation: impl Into<String>, policy: &RetryPolicy) -> Self {
        Self {
            operation: operation.into(),
            policy: *policy,
            failures: 0,
        }
    }

    /// Resets the counter after a successful attempt.
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Counts a retryable failure and decides whether to try again.
    ///
    /// Retries while the consecutive count stays within `max_retries`;
    /// the failure after that aborts.
    pub fn record_failure(&mut self, err: &dyn Display) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.policy.max_retries {
            error!(
                operation = %self.operation,
                attempts = self.failures,
                error = %err,
                "retries exhausted"
            );
            return RetryDecision::Abort {
                attempts: self.failures,
            };
        }

        let delay = self.policy.delay_for_attempt(self.failures);
        warn!(
            operation = %self.operation,
            attempt = self.failures,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retryable failure"
        );
        RetryDecision::Retry {
            attempt: self.failures,
            delay,
        }
    }

    /// Consecutive failures recorded since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            ..Default::default()
        }
    }

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(60));
        assert!((p.backoff_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn delay_backoff_is_capped() {
        let p = RetryPolicy::default();
        let expected = [1, 2, 4, 8, 16, 32, 60, 60];
        for (i, &secs) in expected.iter().enumerate() {
            assert_eq!(
                p.delay_for_attempt((i + 1) as u32),
                Duration::from_secs(secs),
                "attempt {}",
                i + 1
            );
        }
        assert_eq!(p.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn aborts_on_ceiling_plus_one() {
        let mut ctx = RetryContext::new("fetch", &policy(3));
        for attempt in 1..=3 {
            assert!(matches!(
                ctx.record_failure(&"timeout"),
                RetryDecision::Retry { attempt: a, .. } if a == attempt
            ));
        }
        assert_eq!(
            ctx.record_failure(&"timeout"),
            RetryDecision::Abort { attempts: 4 }
        );
    }

    #[test]
    fn success_resets_counter() {
        let mut ctx = policy(2).context("upload part");
        ctx.record_failure(&"reset by peer");
        ctx.record_failure(&"reset by peer");
        assert_eq!(ctx.failures(), 2);

        ctx.record_success();
        assert_eq!(ctx.failures(), 0);

        assert!(matches!(
            ctx.record_failure(&"reset by peer"),
            RetryDecision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            ctx.record_failure(&"reset by peer"),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            ctx.record_failure(&"reset by peer"),
            RetryDecision::Abort { attempts: 3 }
        ));
    }

    #[test]
    fn zero_ceiling_aborts_first_failure() {
        let mut ctx = policy(0).context("describe job");
        assert_eq!(
            ctx.record_failure(&"boom"),
            RetryDecision::Abort { attempts: 1 }
        );
        assert_eq!(ctx.operation(), "describe job");
    }

    #[test]
    fn contexts_are_independent() {
        let p = policy(1);
        let mut a = p.context("a");
        let mut b = p.context("b");
        a.record_failure(&"x");
        assert!(matches!(b.record_failure(&"y"), RetryDecision::Retry { .. }));
        assert!(matches!(a.record_failure(&"x"), RetryDecision::Abort { .. }));
    }
}
