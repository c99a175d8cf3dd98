//! Retry decorators for the build and deploy ports.
//!
//! Stages themselves never retry. Wrapping a [`BuildRunner`] or
//! [`SiteDeployer`] adds exponential backoff for transient failures, as
//! classified by [`Error::is_retryable`].

use async_trait::async_trait;
use sitepipe_core::artifact::ArtifactBundle;
use sitepipe_core::build::{BuildRequest, BuildRunner};
use sitepipe_core::deploy::{DeployReceipt, DeployRequest, SiteDeployer};
use sitepipe_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct RetryingBuildRunner {
    inner: Arc<dyn BuildRunner>,
    policy: RetryPolicy,
}

impl RetryingBuildRunner {
    pub fn new(inner: Arc<dyn BuildRunner>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl BuildRunner for RetryingBuildRunner {
    async fn run(&self, request: BuildRequest) -> Result<ArtifactBundle> {
        let operation = format!("build {}", request.action);
        self.policy
            .run(&operation, |_| self.inner.run(request.clone()))
            .await
    }
}

pub struct RetryingDeployer {
    inner: Arc<dyn SiteDeployer>,
    policy: RetryPolicy,
}

impl RetryingDeployer {
    pub fn new(inner: Arc<dyn SiteDeployer>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl SiteDeployer for RetryingDeployer {
    async fn deploy(&self, request: DeployRequest) -> Result<DeployReceipt> {
        let operation = format!("deploy {}", request.action);
        self.policy
            .run(&operation, |_| self.inner.deploy(request.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(RetryPolicy::none().with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = policy()
            .run("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Error::DeploymentFailed("store unreachable".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff on the paused clock
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("broken", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::ExecutionFailed("exit 1".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExecutionFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_final() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("approval", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Rejected("declined".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
