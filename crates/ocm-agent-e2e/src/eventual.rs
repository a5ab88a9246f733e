//! Bounded polling for conditions that settle asynchronously.
//!
//! Deployment rollouts and freshly spawned port-forwards are not ready the
//! moment we look at them. Each wait has a category with a fixed ceiling so a
//! broken environment fails in bounded time.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// How the delay between attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay between every attempt.
    Fixed,
    /// Delay doubles after every attempt, capped at the remaining time.
    Doubling,
}

/// Timeout ceiling, first delay and backoff for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl PollPolicy {
    pub const fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: Backoff::Fixed,
        }
    }

    pub const fn doubling(timeout: Duration, initial: Duration) -> Self {
        Self {
            timeout,
            interval: initial,
            backoff: Backoff::Doubling,
        }
    }
}

/// Categories of waits with their documented ceilings.
#[derive(Debug, Clone, Copy)]
pub enum ConsistencyCategory {
    /// `kubectl port-forward` answering `/livez` (2s interval, 30s ceiling).
    PortForwardReady,

    /// Deployment reporting `Available=True` (500ms doubling, 5min ceiling).
    DeploymentAvailable,
}

impl ConsistencyCategory {
    pub fn policy(&self) -> PollPolicy {
        match self {
            ConsistencyCategory::PortForwardReady => {
                PollPolicy::fixed(Duration::from_secs(30), Duration::from_secs(2))
            }
            ConsistencyCategory::DeploymentAvailable => {
                PollPolicy::doubling(Duration::from_secs(300), Duration::from_millis(500))
            }
        }
    }
}

/// Poll `condition` until it returns `Ok` or the policy's timeout elapses.
///
/// The condition is always attempted at least once. On timeout the error
/// carries the last failure reported by the condition.
///
/// ```no_run
/// use ocm_agent_e2e::eventual::{wait_for, PollPolicy};
/// use std::time::Duration;
///
/// # async fn example() {
/// wait_for(
///     PollPolicy::fixed(Duration::from_secs(30), Duration::from_secs(2)),
///     || async { Ok::<(), String>(()) },
/// )
/// .await
/// .expect("condition should hold within 30s");
/// # }
/// ```
pub async fn wait_for<F, Fut, E>(policy: PollPolicy, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let mut delay = policy.interval;
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        let last_error = match condition().await {
            Ok(()) => return Ok(()),
            Err(e) => e.to_string(),
        };

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(format!(
                "Condition not met within {:?} after {} attempts: {}",
                policy.timeout, attempts, last_error
            ));
        }

        let remaining = policy.timeout.saturating_sub(elapsed);
        sleep(delay.min(remaining)).await;

        if policy.backoff == Backoff::Doubling {
            delay = delay.saturating_mul(2);
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick() -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(300), Duration::from_millis(20))
    }

    #[test]
    fn test_category_policies() {
        assert_eq!(
            ConsistencyCategory::PortForwardReady.policy(),
            PollPolicy::fixed(Duration::from_secs(30), Duration::from_secs(2))
        );
        assert_eq!(
            ConsistencyCategory::DeploymentAvailable.policy().timeout,
            Duration::from_secs(300)
        );
        assert_eq!(
            ConsistencyCategory::DeploymentAvailable.policy().backoff,
            Backoff::Doubling
        );
    }

    #[tokio::test]
    async fn test_wait_for_succeeds_immediately() {
        let result = wait_for(quick(), || async { Ok::<(), String>(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_succeeds_after_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = wait_for(quick(), move || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= 3 {
                    Ok(())
                } else {
                    Err(format!("attempt {count} not ready"))
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_reports_last_error_on_timeout() {
        let result = wait_for(quick(), || async { Err::<(), _>("connection refused") }).await;

        let err = result.expect_err("should time out");
        assert!(err.contains("not met within"));
        assert!(err.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_wait_for_respects_ceiling() {
        let policy = PollPolicy::doubling(Duration::from_millis(200), Duration::from_millis(10));
        let start = Instant::now();

        let result = wait_for(policy, || async { Err::<(), _>("never") }).await;

        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
