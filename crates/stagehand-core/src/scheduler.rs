//! Scheduler contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BuildId, Filter, Result, Stage};

/// Snapshot of queue depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Stages waiting to be handed out.
    pub pending: usize,
    /// Pollers currently blocked in `request`.
    pub workers: usize,
    pub capacity: usize,
    pub paused: bool,
}

/// Hands ready stages to polling agents and tracks cancellation.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Enqueue a ready stage. Fails with [`crate::Error::QueueFull`] when the
    /// queue is at capacity; callers must not retry forever.
    async fn schedule(&self, stage: &Stage) -> Result<()>;

    /// Wait until a stage matching `filter` is available. Waits without
    /// bound; callers impose their own deadline by dropping the future.
    async fn request(&self, filter: &Filter) -> Result<Stage>;

    /// Signal that a build was cancelled.
    async fn cancel(&self, build: BuildId) -> Result<()>;

    /// Resolve to `true` as soon as the build is cancelled. Resolves
    /// immediately when the cancellation was already signalled; otherwise
    /// waits without bound.
    async fn cancelled(&self, build: BuildId) -> Result<bool>;

    /// Stop handing out stages until `resume`.
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn stats(&self) -> Result<QueueStats>;
}
