//! Store traits.
//!
//! Every `update` takes the row as last read. The write only lands when the
//! stored version still matches; on success the caller's copy is bumped to the
//! new version, otherwise [`DbError::OptimisticLock`] is returned and nothing
//! changes.

use async_trait::async_trait;
use bytes::Bytes;
use stagehand_core::logs::CardInput;
use stagehand_core::{
    Build, BuildId, RepoId, Repository, Secret, Stage, StageId, Step, StepId, User, UserId,
};
use std::sync::Arc;

use crate::DbResult;

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn find(&self, id: BuildId) -> DbResult<Build>;

    async fn find_number(&self, repo: RepoId, number: i64) -> DbResult<Build>;

    /// Persist a build and its stages in one transaction. Ids are assigned
    /// and every row starts at version 1.
    async fn create(&self, build: &mut Build, stages: &mut [Stage]) -> DbResult<()>;

    async fn update(&self, build: &mut Build) -> DbResult<()>;

    /// Delete builds created before `before` together with their stages and
    /// steps. Returns the number of builds removed.
    async fn purge(&self, before: i64) -> DbResult<u64>;
}

#[async_trait]
pub trait StageStore: Send + Sync {
    async fn find(&self, id: StageId) -> DbResult<Stage>;

    /// Stages of a build ordered by number.
    async fn list(&self, build: BuildId) -> DbResult<Vec<Stage>>;

    /// Like `list`, with each stage's steps loaded.
    async fn list_steps(&self, build: BuildId) -> DbResult<Vec<Stage>>;

    /// Pending stages not yet claimed by a machine, oldest first.
    async fn list_incomplete(&self) -> DbResult<Vec<Stage>>;

    async fn create(&self, stage: &mut Stage) -> DbResult<()>;

    /// Version-checked write. The store stamps `updated` so that the written
    /// stage sorts after every finished sibling of its build by
    /// `(updated, number)`; writes of one build are serialized, so the last
    /// stage to finish always holds the greatest key.
    async fn update(&self, stage: &mut Stage) -> DbResult<()>;
}

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn find(&self, id: StepId) -> DbResult<Step>;

    async fn list(&self, stage: StageId) -> DbResult<Vec<Step>>;

    async fn create(&self, step: &mut Step) -> DbResult<()>;

    async fn update(&self, step: &mut Step) -> DbResult<()>;
}

#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn find(&self, id: RepoId) -> DbResult<Repository>;

    async fn find_name(&self, namespace: &str, name: &str) -> DbResult<Repository>;

    async fn create(&self, repo: &mut Repository) -> DbResult<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find(&self, id: UserId) -> DbResult<User>;

    async fn create(&self, user: &mut User) -> DbResult<()>;
}

/// Repository scoped secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn list(&self, repo: RepoId) -> DbResult<Vec<Secret>>;

    async fn create(&self, secret: &mut Secret) -> DbResult<()>;
}

/// Organisation wide secrets, keyed by namespace.
#[async_trait]
pub trait GlobalSecretStore: Send + Sync {
    async fn list(&self, namespace: &str) -> DbResult<Vec<Secret>>;

    async fn create(&self, secret: &mut Secret) -> DbResult<()>;
}

/// Complete step logs, stored once the step ends.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn find(&self, step: StepId) -> DbResult<Bytes>;

    /// Store the log of a step, replacing any earlier upload.
    async fn create(&self, step: StepId, data: Bytes) -> DbResult<()>;

    async fn delete(&self, step: StepId) -> DbResult<()>;
}

#[async_trait]
pub trait CardStore: Send + Sync {
    async fn find(&self, step: StepId) -> DbResult<CardInput>;

    async fn create(&self, step: StepId, card: &CardInput) -> DbResult<()>;
}

/// Every store behind one handle, as consumed by the manager.
#[derive(Clone)]
pub struct Stores {
    pub builds: Arc<dyn BuildStore>,
    pub stages: Arc<dyn StageStore>,
    pub steps: Arc<dyn StepStore>,
    pub repos: Arc<dyn RepositoryStore>,
    pub users: Arc<dyn UserStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub global_secrets: Arc<dyn GlobalSecretStore>,
    pub logs: Arc<dyn LogStore>,
    pub cards: Arc<dyn CardStore>,
}

impl Stores {
    fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: BuildStore
            + StageStore
            + StepStore
            + RepositoryStore
            + UserStore
            + SecretStore
            + GlobalSecretStore
            + LogStore
            + CardStore
            + 'static,
    {
        Self {
            builds: backend.clone(),
            stages: backend.clone(),
            steps: backend.clone(),
            repos: backend.clone(),
            users: backend.clone(),
            secrets: backend.clone(),
            global_secrets: backend.clone(),
            logs: backend.clone(),
            cards: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(crate::MemoryStore::new()))
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self::from_backend(Arc::new(crate::PgStore::new(pool)))
    }
}
