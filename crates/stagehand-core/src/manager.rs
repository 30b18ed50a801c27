//! The interface build agents use to talk to the server.
//!
//! Implemented in-process by the manager and remotely by the RPC client, so
//! an agent never knows which side of a network boundary it is on.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::logs::{CardInput, Line};
use crate::{
    Build, BuildId, Netrc, RepoId, Repository, Result, Secret, Stage, StageId, Step, StepId,
    System,
};

/// Describes the stages an agent is able to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub kind: String,
    #[serde(rename = "type", default)]
    pub kind_type: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// A pipeline configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub data: String,
    #[serde(default)]
    pub kind: String,
}

/// Everything an agent needs to execute a stage. Assembled on demand by
/// `details` and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub repository: Repository,
    pub build: Build,
    pub stage: Stage,
    pub config: Config,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    pub system: System,
}

/// One operation per stage lifecycle event.
#[async_trait]
pub trait BuildManager: Send + Sync {
    /// Request the next stage matching `filter`. `None` means the bounded
    /// wait elapsed without work; callers should poll again.
    async fn request(&self, filter: &Filter) -> Result<Option<Stage>>;

    /// Claim a stage for `machine`. Exactly one concurrent caller wins; the
    /// rest receive [`crate::Error::OptimisticLock`].
    async fn accept(&self, stage: StageId, machine: &str) -> Result<Stage>;

    /// Clone credentials for a repository, if it needs any.
    async fn netrc(&self, repo: RepoId) -> Result<Option<Netrc>>;

    /// Assemble the execution context for a stage.
    async fn details(&self, stage: StageId) -> Result<Context>;

    /// Signal that a step is about to start. The step's id and version are
    /// updated in place.
    async fn before(&self, step: &mut Step) -> Result<()>;

    /// Signal that a step finished. The step's version is updated in place.
    async fn after(&self, step: &mut Step) -> Result<()>;

    /// Signal that a stage is about to start. Version, timestamps and step
    /// ids are updated in place.
    async fn before_all(&self, stage: &mut Stage) -> Result<()>;

    /// Signal that a stage finished.
    async fn after_all(&self, stage: &mut Stage) -> Result<()>;

    /// Wait for the build to be cancelled or finished. When nothing happened
    /// within the bounded wait, returns `false` or a deadline error; callers
    /// treat both as "poll again".
    async fn watch(&self, build: BuildId) -> Result<bool>;

    /// Append a line to the live log of a step.
    async fn write(&self, step: StepId, line: &Line) -> Result<()>;

    /// Store the complete log of a step.
    async fn upload(&self, step: StepId, data: Bytes) -> Result<()>;

    async fn upload_bytes(&self, step: StepId, data: &[u8]) -> Result<()> {
        self.upload(step, Bytes::copy_from_slice(data)).await
    }

    /// Attach a card to a step.
    async fn upload_card(&self, step: StepId, card: &CardInput) -> Result<()>;
}

/// Administrative cancellation of a build.
#[async_trait]
pub trait BuildCanceler: Send + Sync {
    /// Kill the build and its unfinished stages. Agents running one of its
    /// stages see the kill through [`BuildManager::watch`].
    async fn cancel(&self, build: BuildId) -> Result<()>;
}
