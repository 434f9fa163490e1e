//! Bounded exponential backoff with jitter.

use crate::config::ConfigError;
use crate::observability::events;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const COMPONENT: &str = "backoff";

/// Retry budget and delay curve for operations that may fail transiently.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, `0` retries forever.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomise each delay into `[delay * (1 - jitter), delay * (1 + jitter)]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn infinite() -> Self {
        Self::with_max_attempts(0)
    }

    /// Rejects curves that cannot produce a delay: a multiplier below `1.0`,
    /// jitter outside `[0, 1]`, or a start above the cap.
    pub fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { field, reason });

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return invalid(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return invalid(format!("jitter must be within [0, 1], got {}", self.jitter));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return invalid(format!(
                "initial_delay_ms {} exceeds max_delay_ms {}",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            delay: Duration::from_millis(self.initial_delay_ms),
        }
    }
}

/// Stateful delay iterator produced by [`RetryPolicy::backoff`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    /// Records one failed attempt. Returns the delay before the next attempt, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.policy.max_attempts > 0 && self.attempt >= self.policy.max_attempts {
            return None;
        }

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let jittered = Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor)
            .unwrap_or(self.delay);

        let max_delay = Duration::from_millis(self.policy.max_delay_ms);
        self.delay = Duration::try_from_secs_f64(self.delay.as_secs_f64() * self.policy.multiplier)
            .unwrap_or(max_delay)
            .min(max_delay);

        Some(jittered)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = Duration::from_millis(self.policy.initial_delay_ms);
    }
}

/// Runs `operation` until it succeeds or `policy` is exhausted, sleeping between
/// attempts. `should_continue` is consulted before and after every sleep;
/// returning `false` gives up early with the last error.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut should_continue: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: FnMut() -> bool,
{
    let mut backoff = policy.backoff();

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                let Some(delay) = backoff.next_delay() else {
                    warn!(
                        event = events::RETRY_EXHAUSTED,
                        component = COMPONENT,
                        operation = operation_name,
                        attempts = backoff.attempts(),
                        err = %err,
                        "operation failed after exhausting retry budget"
                    );
                    return Err(err);
                };

                if !should_continue() {
                    debug!(
                        event = events::RETRY_ABANDONED,
                        component = COMPONENT,
                        operation = operation_name,
                        attempts = backoff.attempts(),
                        "retry abandoned"
                    );
                    return Err(err);
                }

                debug!(
                    event = events::RETRY_SCHEDULED,
                    component = COMPONENT,
                    operation = operation_name,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    err = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;

                if !should_continue() {
                    debug!(
                        event = events::RETRY_ABANDONED,
                        component = COMPONENT,
                        operation = operation_name,
                        attempts = backoff.attempts(),
                        "retry abandoned after backoff"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{retry_with_backoff, RetryPolicy};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_until_capped_and_stops_at_budget() {
        let mut backoff = fast_policy(5).backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(4)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn infinite_policy_never_exhausts() {
        let mut backoff = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::infinite()
        }
        .backoff();

        for _ in 0..1_000 {
            assert!(backoff.next_delay().is_some());
        }
    }

    #[test]
    fn reset_restarts_the_curve() {
        let mut backoff = fast_policy(3).backoff();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(
            &fast_policy(5),
            "flaky",
            || true,
            || {
                let counter = counter.clone();
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if call < 3 {
                        Err(format!("failure {call}"))
                    } else {
                        Ok(call)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_error_when_budget_is_spent() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = retry_with_backoff(
            &fast_policy(3),
            "always-fails",
            || true,
            || {
                let counter = counter.clone();
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {call}"))
                }
            },
        )
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_when_caller_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), &str> = retry_with_backoff(
            &fast_policy(0),
            "abandoned",
            || false,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            },
        )
        .await;

        assert_eq!(result, Err("nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_rechecks_after_sleeping() {
        let calls = Arc::new(AtomicU32::new(0));
        let proceed = Arc::new(AtomicBool::new(true));
        let policy = RetryPolicy {
            initial_delay_ms: 50,
            max_delay_ms: 50,
            ..fast_policy(0)
        };

        let flip = proceed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flip.store(false, Ordering::SeqCst);
        });

        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            "gone-while-sleeping",
            || proceed.load(Ordering::SeqCst),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            },
        )
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_curves_are_rejected() {
        let shrinking = RetryPolicy {
            multiplier: -2.0,
            ..RetryPolicy::default()
        };
        let noisy = RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        };
        let inverted = RetryPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 1,
            ..RetryPolicy::default()
        };

        assert!(RetryPolicy::default().validate("publish_retry").is_ok());
        for policy in [shrinking, noisy, inverted] {
            assert!(policy.validate("publish_retry").is_err(), "{policy:?}");
        }
    }

    #[test]
    fn unvalidated_negative_multiplier_does_not_panic() {
        let mut backoff = RetryPolicy {
            multiplier: -2.0,
            jitter: 0.0,
            ..fast_policy(4)
        }
        .backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        assert!(backoff.next_delay().is_some());
    }
}
