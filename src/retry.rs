//! Retry middleware with bounded exponential backoff.
//!
//! Retry applies per node invocation, never per whole-graph execution. Every
//! error is retryable unless the policy carries a classification hook that
//! says otherwise. Backoff waits race the run's cancellation token, so a
//! cancelled context aborts the wait immediately.

use crate::error::Cancelled;
use crate::executor::ExecutionContext;
use crate::middleware::{Next, NodeFuture, NodeMiddleware};
use crate::node::Node;
use crate::state::WorkflowState;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default backoff base.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 100;

/// Default backoff cap.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 5_000;

/// Bounded exponential backoff between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the given retry (1-based: the wait after the first
    /// failure is `delay(1)`). Doubles each retry, bounded by the cap.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
        }
    }
}

/// Rejected retry configuration.
#[derive(Debug, Error)]
#[error("max_attempts must be at least 1")]
pub struct InvalidRetryPolicy;

type ClassifyFn = dyn Fn(&anyhow::Error) -> bool + Send + Sync;

/// Retry budget for a single node invocation.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    classify: Option<Arc<ClassifyFn>>,
}

impl RetryPolicy {
    /// A policy allowing up to `max_attempts` invocations (>= 1).
    pub fn new(max_attempts: u32) -> Result<Self, InvalidRetryPolicy> {
        if max_attempts < 1 {
            return Err(InvalidRetryPolicy);
        }
        Ok(Self {
            max_attempts,
            backoff: Backoff::default(),
            classify: None,
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Only retry errors for which the hook returns true.
    pub fn retry_if(
        mut self,
        classify: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classify = Some(Arc::new(classify));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Middleware that re-runs a failed invocation with backoff.
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Convenience constructor producing the trait object the builder takes.
    pub fn layer(policy: RetryPolicy) -> Arc<dyn NodeMiddleware> {
        Arc::new(Self::new(policy))
    }
}

impl NodeMiddleware for RetryMiddleware {
    fn wrap(
        self: Arc<Self>,
        ctx: ExecutionContext,
        node: Node,
        state: WorkflowState,
        next: Next,
    ) -> NodeFuture {
        async move {
            let policy = &self.policy;
            let mut attempt = 1u32;
            loop {
                match next.run(state.clone()).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(err) => {
                        if ctx.is_cancelled() || err.is::<Cancelled>() {
                            return Err(Cancelled.into());
                        }
                        let retryable =
                            policy.classify.as_ref().map(|f| f(&err)).unwrap_or(true);
                        if !retryable || attempt >= policy.max_attempts {
                            return Err(err.context(format!(
                                "node '{}' gave up after {} attempt(s)",
                                node.id, attempt
                            )));
                        }
                        let delay = policy.backoff.delay(attempt);
                        warn!(
                            node = %node.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "node failed, backing off before retry"
                        );
                        tokio::select! {
                            _ = ctx.cancelled() => return Err(Cancelled.into()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    }
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::compose;
    use crate::node::{handler_fn, NodeOutcome};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn flaky_node(fail_first: u32, calls: Arc<AtomicU32>) -> Node {
        let handler = handler_fn(move |_ctx, state| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_first {
                    anyhow::bail!("transient failure {n}");
                }
                Ok(NodeOutcome::Advance(state))
            }
        });
        Node::new("flaky", handler)
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(30), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(RetryPolicy::new(0).is_err());
        assert!(RetryPolicy::new(1).is_ok());
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempt_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky_node(u32::MAX, calls.clone());
        let layer = RetryMiddleware::layer(
            RetryPolicy::new(3).unwrap().with_backoff(fast_backoff()),
        );

        let ctx = ExecutionContext::new();
        let chain = compose(&[layer], &ctx, &node);
        let err = chain.run(WorkflowState::new()).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("3 attempt"), "got: {err}");
    }

    #[tokio::test]
    async fn test_success_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky_node(1, calls.clone());
        let layer = RetryMiddleware::layer(
            RetryPolicy::new(5).unwrap().with_backoff(fast_backoff()),
        );

        let ctx = ExecutionContext::new();
        let chain = compose(&[layer], &ctx, &node);
        chain.run(WorkflowState::new()).await.unwrap();

        // failed once, succeeded on the second attempt, never tried again
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_classification_hook_stops_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky_node(u32::MAX, calls.clone());
        let policy = RetryPolicy::new(5)
            .unwrap()
            .with_backoff(fast_backoff())
            .retry_if(|err| !err.to_string().contains("transient failure 2"));
        let layer = RetryMiddleware::layer(policy);

        let ctx = ExecutionContext::new();
        let chain = compose(&[layer], &ctx, &node);
        let err = chain.run(WorkflowState::new()).await.unwrap_err();

        // second error was classified fatal
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("2 attempt"), "got: {err}");
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = flaky_node(u32::MAX, calls.clone());
        let policy = RetryPolicy::new(10)
            .unwrap()
            .with_backoff(Backoff::new(Duration::from_secs(5), Duration::from_secs(5)));
        let layer = RetryMiddleware::layer(policy);

        let ctx = ExecutionContext::new();
        let chain = compose(&[layer], &ctx, &node);

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = chain.run(WorkflowState::new()).await.unwrap_err();

        // aborted long before the 5s backoff elapsed, with a cancellation
        // error rather than the handler's error
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(err.is::<Cancelled>());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
