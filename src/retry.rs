//! Retry policies for peer RPCs.
//!
//! Only transport failures are retried. Conflicts and rejections carry a
//! protocol verdict, so retrying them with the same request cannot succeed.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `follower_policy` | 100ms | 2s | 5 | Proposal fan-out |
//! | `commit_policy` | 200ms | 5s | 8 | Commit fan-out after the local commit |
//! | `notify_policy` | 50ms | 1s | 3 | Best-effort cancel notifications |

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::gossip::{GossipError, GossipResult};
use crate::metrics::RETRY_ATTEMPTS;

/// Policy for reading a follower's view and pushing a proposal to it.
///
/// Bounded tighter than the attempt timeout so a dead follower aborts the
/// attempt through retry exhaustion rather than the deadline.
pub fn follower_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for gossiping a commit the leader has already applied.
pub fn commit_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(8)
        .with_jitter()
}

/// Policy for fire-and-forget notifications.
pub fn notify_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(3)
        .with_jitter()
}

/// Run a gossip operation under `policy`, retrying transport errors only.
pub async fn with_policy<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> GossipResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GossipResult<T>>,
{
    let result = operation
        .retry(policy)
        .when(GossipError::is_retryable)
        .notify(|err: &GossipError, delay: Duration| {
            record_retry_attempt(policy_name, err, delay);
        })
        .await;

    match &result {
        Ok(_) => RETRY_ATTEMPTS.with_label_values(&[policy_name, "success"]).inc(),
        Err(e) if e.is_retryable() => record_retry_exhausted(policy_name, e),
        Err(_) => RETRY_ATTEMPTS.with_label_values(&[policy_name, "refused"]).inc(),
    }
    result
}

fn record_retry_attempt(policy_name: &str, err: &GossipError, delay: Duration) {
    RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(
        policy = policy_name,
        error = %err,
        delay_ms = delay.as_millis() as u64,
        "Retrying gossip call"
    );
}

fn record_retry_exhausted(policy_name: &str, err: &GossipError) {
    RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, error = %err, "Retry policy exhausted");
}
