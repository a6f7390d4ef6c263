//! Order submission retries
//!
//! A submission that fails with a transient `ExecutionError` is retried with
//! exponential backoff until the policy's budget runs out. The worker gets the
//! final outcome together with the number of attempts it took, which ends up
//! in the `order_rejected` log entry and the `order_retries` counter.

use super::execution::{OrderExecutor, OrderRequest};
use super::metrics::Metrics;
use super::order_errors::ExecutionError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy for submitting one order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Each retry waits this many times longer than the previous one
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry `retry` (1-indexed), capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Final result of submitting one order
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Venue reference on acceptance
    pub outcome: Result<String, ExecutionError>,
    /// Calls made to the port, including the first
    pub attempts: u32,
}

/// Submit `request`, retrying transient failures under `policy`
pub async fn submit_with_retry(
    executor: &dyn OrderExecutor,
    request: &OrderRequest,
    policy: &RetryPolicy,
    metrics: &Metrics,
) -> Submission {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match executor.submit(request).await {
            Ok(exchange_ref) => {
                return Submission {
                    outcome: Ok(exchange_ref),
                    attempts,
                }
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Submission {
                outcome: Err(err),
                attempts,
            };
        }
        if attempts > policy.max_retries {
            warn!(
                "[Retry] Bot {} order {} still failing after {} attempts on {}: {}",
                request.bot_id,
                request.order_id,
                attempts,
                executor.name(),
                err
            );
            return Submission {
                outcome: Err(err),
                attempts,
            };
        }

        let delay = policy.delay_for(attempts);
        metrics.inc_order_retries();
        debug!(
            "[Retry] Bot {} order {} attempt {}/{} failed ({}), retrying in {}ms",
            request.bot_id,
            request.order_id,
            attempts,
            policy.max_retries + 1,
            err,
            delay.as_millis()
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderRole, Side};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Port that replays a fixed script of submit results
    struct ScriptedExecutor {
        script: Mutex<Vec<Result<String, ExecutionError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedExecutor {
        fn new(mut script: Vec<Result<String, ExecutionError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl OrderExecutor for ScriptedExecutor {
        async fn submit(&self, _request: &OrderRequest) -> Result<String, ExecutionError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(ExecutionError::Timeout))
        }

        async fn cancel(&self, _exchange_ref: &str) -> Result<(), ExecutionError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2,
        }
    }

    fn request() -> OrderRequest {
        OrderRequest {
            order_id: "order-1".into(),
            bot_id: 7,
            pair: "BTC/USDT".into(),
            side: Side::Buy,
            role: OrderRole::DcaBase,
            quantity: dec!(1),
            price: dec!(100),
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            multiplier: 2,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_accepted_after_transient_failures() {
        let executor = ScriptedExecutor::new(vec![
            Err(ExecutionError::RateLimited),
            Err(ExecutionError::Timeout),
            Ok("ref-1".into()),
        ]);
        let metrics = Metrics::new();

        let submission = submit_with_retry(&executor, &request(), &fast_policy(), &metrics).await;

        assert_eq!(submission.outcome, Ok("ref-1".to_string()));
        assert_eq!(submission.attempts, 3);
        assert_eq!(metrics.snapshot().order_retries, 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_bounded() {
        let executor = ScriptedExecutor::new(Vec::new());
        let metrics = Metrics::new();

        let submission = submit_with_retry(&executor, &request(), &fast_policy(), &metrics).await;

        assert_eq!(submission.outcome, Err(ExecutionError::Timeout));
        // first try + 3 retries
        assert_eq!(submission.attempts, 4);
        assert_eq!(executor.calls(), 4);
        assert_eq!(metrics.snapshot().order_retries, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let executor = ScriptedExecutor::new(vec![Err(ExecutionError::InsufficientFunds)]);
        let metrics = Metrics::new();

        let submission = submit_with_retry(&executor, &request(), &fast_policy(), &metrics).await;

        assert_eq!(submission.outcome, Err(ExecutionError::InsufficientFunds));
        assert_eq!(submission.attempts, 1);
        assert_eq!(metrics.snapshot().order_retries, 0);
    }
}
