//! Bounded worker pool in front of any [`SandboxExecutor`].
//!
//! Permits are handed out in FIFO order by `tokio::sync::Semaphore`; waiting
//! for a permit is the only place an execution request is suspended.

use super::{ResourceLimits, SandboxExecutor, SandboxFault, TestHarness, TestOutcome};
use crate::artifact::CandidateArtifact;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::trace;

pub struct BoundedExecutor<E> {
    inner: E,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl<E: SandboxExecutor> BoundedExecutor<E> {
    /// `max_concurrent` of zero is raised to one.
    pub fn new(inner: E, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self { inner, semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Executions currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: SandboxExecutor> SandboxExecutor for BoundedExecutor<E> {
    async fn execute(
        &self,
        artifact: &CandidateArtifact,
        harness: &TestHarness,
        limits: &ResourceLimits,
    ) -> TestOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return TestOutcome::fault(
                    SandboxFault::Spawn { reason: "sandbox pool closed".into() },
                    Duration::ZERO,
                )
            }
        };
        trace!(in_flight = self.in_flight(), harness = %harness.name, "sandbox permit acquired");
        self.inner.execute(artifact, harness, limits).await
    }
}
