//! crates/bedtime_core/src/retry.rs
//!
//! Exponential backoff with jitter for model calls.
//!
//! Only `PortError::Transient` failures are retried for text generation; image
//! attempts are retried on any failure by their callers.

use rand::Rng;
use std::time::Duration;
use tokio_retry2::{Retry, RetryError};
use tracing::warn;

use crate::domain::{ChatTurn, Completion, SamplingParams};
use crate::ports::{PortError, PortResult, TextGenerationService};
use crate::session::ModelSession;

/// Delay after the n-th failed attempt is `min(max_delay, base_delay * 2^n + jitter)`
/// with jitter drawn uniformly from `[0, max_jitter]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting. Used by tests and local runs.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(failed_attempts));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        exponential.saturating_add(jitter).min(self.max_delay)
    }

    /// The waits between attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let policy = self.clone();
        (1..policy.max_attempts.max(1)).map(move |n| policy.delay_for(n as u32))
    }
}

fn classify(err: PortError) -> RetryError<PortError> {
    if err.is_retryable() {
        warn!("Transient model error, will retry: {}", err);
        RetryError::Transient {
            err,
            retry_after: None,
        }
    } else {
        RetryError::Permanent(err)
    }
}

/// Single stateless request with retries on transient failures.
pub async fn generate_with_retry(
    model: &dyn TextGenerationService,
    turns: &[ChatTurn],
    params: &SamplingParams,
    policy: &RetryPolicy,
) -> PortResult<Completion> {
    Retry::spawn(policy.delays(), || async {
        model.generate(turns, params).await.map_err(classify)
    })
    .await
}

/// Sends through a session, retrying transient failures. The session only
/// records an exchange once it succeeds, so a retry resends the same history.
///
/// Walks the same `policy.delays()` schedule as `generate_with_retry`; the
/// `&mut` session borrow cannot be handed to `Retry::spawn`'s closure.
pub async fn send_with_retry(
    session: &mut ModelSession,
    message: &str,
    policy: &RetryPolicy,
) -> PortResult<Completion> {
    let mut delays = policy.delays();
    let mut attempt = 1;
    loop {
        match session.send(message).await {
            Ok(completion) => return Ok(completion),
            Err(e) if e.is_retryable() => match delays.next() {
                Some(delay) => {
                    warn!(
                        "Attempt {} of {} failed: {}. Retrying in {:?}",
                        attempt, policy.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        transient: bool,
    }

    #[async_trait]
    impl TextGenerationService for Flaky {
        async fn generate(
            &self,
            _turns: &[ChatTurn],
            _params: &SamplingParams,
        ) -> PortResult<Completion> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.transient {
                    PortError::Transient("rate limited".into())
                } else {
                    PortError::Unexpected("bad request".into())
                });
            }
            Ok(Completion {
                text: "ok".into(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    fn flaky(failures: usize, transient: bool) -> Flaky {
        Flaky {
            calls: AtomicUsize::new(0),
            failures,
            transient,
        }
    }

    #[test]
    fn test_delays_are_capped_and_counted() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays[0] >= Duration::from_secs(2) && delays[0] <= Duration::from_secs(3));
        assert!(delays[3] >= Duration::from_secs(16) && delays[3] <= Duration::from_secs(17));
        assert_eq!(policy.delay_for(10), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let model = flaky(4, true);
        let result = generate_with_retry(
            &model,
            &[ChatTurn::user("hi")],
            &SamplingParams::with_temperature(0.5),
            &RetryPolicy::immediate(5),
        )
        .await;
        assert_eq!(result.unwrap().text, "ok");
        assert_eq!(model.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retries_exhaust_after_max_attempts() {
        let model = flaky(10, true);
        let result = generate_with_retry(
            &model,
            &[ChatTurn::user("hi")],
            &SamplingParams::with_temperature(0.5),
            &RetryPolicy::immediate(5),
        )
        .await;
        assert!(matches!(result, Err(PortError::Transient(_))));
        assert_eq!(model.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_session_sends_follow_the_same_schedule() {
        for (failures, succeeds) in [(4, true), (10, false)] {
            let model = Arc::new(flaky(failures, true));
            let mut session = ModelSession::new(model.clone(), Default::default());
            let result = send_with_retry(&mut session, "hi", &RetryPolicy::immediate(5)).await;
            assert_eq!(result.is_ok(), succeeds);
            assert_eq!(model.calls.load(Ordering::SeqCst), 5);
            // failed attempts leave no trace in the history
            assert_eq!(session.history().len(), if succeeds { 2 } else { 0 });
        }
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_immediately() {
        let model = flaky(1, false);
        let result = generate_with_retry(
            &model,
            &[ChatTurn::user("hi")],
            &SamplingParams::with_temperature(0.5),
            &RetryPolicy::immediate(5),
        )
        .await;
        assert!(matches!(result, Err(PortError::Unexpected(_))));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
