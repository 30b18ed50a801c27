//! External collaborators consumed by the manager.
//!
//! Each is a narrow capability injected at construction; the manager never
//! knows about concrete transports or SCM providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::logs::Line;
use crate::{Build, Config, Netrc, Repository, Result, StepId, User};

/// A build event published to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Repository slug.
    pub repository: String,
    pub visibility: String,
    /// JSON encoded build, including its stages.
    pub data: String,
}

impl Message {
    pub fn for_build(repo: &Repository, build: &Build) -> Result<Self> {
        let data = serde_json::to_string(build).map_err(|e| crate::Error::Internal(e.to_string()))?;
        Ok(Self {
            repository: repo.slug.clone(),
            visibility: repo.visibility.clone(),
            data,
        })
    }
}

#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn publish(&self, message: Message) -> Result<()>;
}

/// What a commit status update reports on.
#[derive(Debug, Clone)]
pub struct StatusInput<'a> {
    pub repo: &'a Repository,
    pub build: &'a Build,
}

/// Sends commit statuses to the SCM. Providers without status support return
/// [`crate::Error::NotSupported`].
#[async_trait]
pub trait StatusService: Send + Sync {
    async fn send(&self, user: &User, input: &StatusInput<'_>) -> Result<()>;
}

/// Arguments for locating and converting pipeline configuration.
#[derive(Debug, Clone)]
pub struct ConfigArgs<'a> {
    pub user: &'a User,
    pub repo: &'a Repository,
    pub build: &'a Build,
}

/// Fetches the raw pipeline configuration for a build.
#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn find(&self, args: &ConfigArgs<'_>) -> Result<Config>;
}

/// Converts configuration, e.g. upgrading legacy formats.
#[async_trait]
pub trait ConvertService: Send + Sync {
    async fn convert(&self, args: &ConfigArgs<'_>, config: Config) -> Result<Config>;
}

/// Derives short-lived clone credentials.
#[async_trait]
pub trait NetrcService: Send + Sync {
    async fn create(&self, user: &User, repo: &Repository) -> Result<Option<Netrc>>;
}

/// Live log streaming for running steps.
#[async_trait]
pub trait LogStream: Send + Sync {
    async fn create(&self, step: StepId) -> Result<()>;
    async fn delete(&self, step: StepId) -> Result<()>;
    async fn write(&self, step: StepId, line: &Line) -> Result<()>;
}
