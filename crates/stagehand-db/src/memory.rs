//! In-memory store.
//!
//! Backs tests and single-node deployments without a database. Honours the
//! same version checks as the PostgreSQL store.

use async_trait::async_trait;
use bytes::Bytes;
use stagehand_core::logs::CardInput;
use stagehand_core::{
    Build, BuildId, RepoId, Repository, Secret, Stage, StageId, Status, Step, StepId, User,
    UserId, now,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::store::*;
use crate::{DbError, DbResult};

#[derive(Default)]
struct Tables {
    seq: i64,
    builds: BTreeMap<BuildId, Build>,
    stages: BTreeMap<StageId, Stage>,
    steps: BTreeMap<StepId, Step>,
    repos: BTreeMap<RepoId, Repository>,
    users: BTreeMap<UserId, User>,
    secrets: Vec<Secret>,
    global_secrets: Vec<Secret>,
    logs: HashMap<StepId, Bytes>,
    cards: HashMap<StepId, CardInput>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn steps_of(&self, stage: StageId) -> Vec<Step> {
        let mut steps: Vec<Step> = self
            .steps
            .values()
            .filter(|s| s.stage_id == stage)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.number);
        steps
    }

    fn stages_of(&self, build: BuildId) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self
            .stages
            .values()
            .filter(|s| s.build_id == build)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.number);
        stages
    }

    /// Earliest `updated` that orders `stage` after every finished sibling
    /// by `(updated, number)`.
    fn stamp(&self, stage: &Stage) -> i64 {
        self.stages
            .values()
            .filter(|s| s.build_id == stage.build_id && s.id != stage.id && s.status.is_done())
            .map(|s| {
                if s.number >= stage.number {
                    s.updated + 1
                } else {
                    s.updated
                }
            })
            .fold(now(), i64::max)
    }
}

/// Checks the caller's version against the stored row and bumps it.
fn check_version(stored: Option<i64>, version: &mut i64) -> DbResult<()> {
    match stored {
        Some(current) if current == *version => {
            *version += 1;
            Ok(())
        }
        _ => Err(DbError::OptimisticLock),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn find(&self, id: BuildId) -> DbResult<Build> {
        let tables = self.tables.lock().await;
        tables
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))
    }

    async fn find_number(&self, repo: RepoId, number: i64) -> DbResult<Build> {
        let tables = self.tables.lock().await;
        tables
            .builds
            .values()
            .find(|b| b.repo_id == repo && b.number == number)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {repo}/{number}")))
    }

    async fn create(&self, build: &mut Build, stages: &mut [Stage]) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        build.id = BuildId(tables.next_id());
        build.version = 1;
        let mut row = build.clone();
        row.stages.clear();
        tables.builds.insert(build.id, row);

        for stage in stages.iter_mut() {
            stage.id = StageId(tables.next_id());
            stage.build_id = build.id;
            stage.repo_id = build.repo_id;
            stage.version = 1;
            let mut row = stage.clone();
            row.steps.clear();
            tables.stages.insert(stage.id, row);
        }
        Ok(())
    }

    async fn update(&self, build: &mut Build) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables.builds.get(&build.id).map(|b| b.version);
        check_version(stored, &mut build.version)?;
        let mut row = build.clone();
        row.stages.clear();
        tables.builds.insert(build.id, row);
        Ok(())
    }

    async fn purge(&self, before: i64) -> DbResult<u64> {
        let mut tables = self.tables.lock().await;
        let doomed: Vec<BuildId> = tables
            .builds
            .values()
            .filter(|b| b.created < before)
            .map(|b| b.id)
            .collect();
        for id in &doomed {
            tables.builds.remove(id);
            let stages: Vec<StageId> = tables
                .stages
                .values()
                .filter(|s| s.build_id == *id)
                .map(|s| s.id)
                .collect();
            for stage in stages {
                tables.stages.remove(&stage);
                let steps: Vec<StepId> = tables
                    .steps
                    .values()
                    .filter(|s| s.stage_id == stage)
                    .map(|s| s.id)
                    .collect();
                for step in steps {
                    tables.steps.remove(&step);
                    tables.logs.remove(&step);
                    tables.cards.remove(&step);
                }
            }
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl StageStore for MemoryStore {
    async fn find(&self, id: StageId) -> DbResult<Stage> {
        let tables = self.tables.lock().await;
        tables
            .stages
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("stage {id}")))
    }

    async fn list(&self, build: BuildId) -> DbResult<Vec<Stage>> {
        Ok(self.tables.lock().await.stages_of(build))
    }

    async fn list_steps(&self, build: BuildId) -> DbResult<Vec<Stage>> {
        let tables = self.tables.lock().await;
        let mut stages = tables.stages_of(build);
        for stage in &mut stages {
            stage.steps = tables.steps_of(stage.id);
        }
        Ok(stages)
    }

    async fn list_incomplete(&self) -> DbResult<Vec<Stage>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .stages
            .values()
            .filter(|s| s.status == Status::Pending && s.machine.is_empty())
            .cloned()
            .collect())
    }

    async fn create(&self, stage: &mut Stage) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        stage.id = StageId(tables.next_id());
        stage.version = 1;
        let mut row = stage.clone();
        row.steps.clear();
        tables.stages.insert(stage.id, row);
        Ok(())
    }

    async fn update(&self, stage: &mut Stage) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables.stages.get(&stage.id).map(|s| s.version);
        check_version(stored, &mut stage.version)?;
        stage.updated = tables.stamp(stage);
        let mut row = stage.clone();
        row.steps.clear();
        tables.stages.insert(stage.id, row);
        Ok(())
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn find(&self, id: StepId) -> DbResult<Step> {
        let tables = self.tables.lock().await;
        tables
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("step {id}")))
    }

    async fn list(&self, stage: StageId) -> DbResult<Vec<Step>> {
        Ok(self.tables.lock().await.steps_of(stage))
    }

    async fn create(&self, step: &mut Step) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        step.id = StepId(tables.next_id());
        step.version = 1;
        tables.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn update(&self, step: &mut Step) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables.steps.get(&step.id).map(|s| s.version);
        check_version(stored, &mut step.version)?;
        tables.steps.insert(step.id, step.clone());
        Ok(())
    }
}

#[async_trait]
impl RepositoryStore for MemoryStore {
    async fn find(&self, id: RepoId) -> DbResult<Repository> {
        let tables = self.tables.lock().await;
        tables
            .repos
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("repository {id}")))
    }

    async fn find_name(&self, namespace: &str, name: &str) -> DbResult<Repository> {
        let tables = self.tables.lock().await;
        tables
            .repos
            .values()
            .find(|r| r.namespace == namespace && r.name == name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("repository {namespace}/{name}")))
    }

    async fn create(&self, repo: &mut Repository) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        repo.id = RepoId(tables.next_id());
        repo.version = 1;
        tables.repos.insert(repo.id, repo.clone());
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find(&self, id: UserId) -> DbResult<User> {
        let tables = self.tables.lock().await;
        tables
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("user {id}")))
    }

    async fn create(&self, user: &mut User) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        user.id = UserId(tables.next_id());
        tables.users.insert(user.id, user.clone());
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn list(&self, repo: RepoId) -> DbResult<Vec<Secret>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .secrets
            .iter()
            .filter(|s| s.repo_id == repo)
            .cloned()
            .collect())
    }

    async fn create(&self, secret: &mut Secret) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        secret.id = tables.next_id();
        tables.secrets.push(secret.clone());
        Ok(())
    }
}

#[async_trait]
impl GlobalSecretStore for MemoryStore {
    async fn list(&self, namespace: &str) -> DbResult<Vec<Secret>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .global_secrets
            .iter()
            .filter(|s| s.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create(&self, secret: &mut Secret) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        secret.id = tables.next_id();
        tables.global_secrets.push(secret.clone());
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn find(&self, step: StepId) -> DbResult<Bytes> {
        let tables = self.tables.lock().await;
        tables
            .logs
            .get(&step)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("logs for step {step}")))
    }

    async fn create(&self, step: StepId, data: Bytes) -> DbResult<()> {
        self.tables.lock().await.logs.insert(step, data);
        Ok(())
    }

    async fn delete(&self, step: StepId) -> DbResult<()> {
        self.tables.lock().await.logs.remove(&step);
        Ok(())
    }
}

#[async_trait]
impl CardStore for MemoryStore {
    async fn find(&self, step: StepId) -> DbResult<CardInput> {
        let tables = self.tables.lock().await;
        tables
            .cards
            .get(&step)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("card for step {step}")))
    }

    async fn create(&self, step: StepId, card: &CardInput) -> DbResult<()> {
        self.tables.lock().await.cards.insert(step, card.clone());
        Ok(())
    }
}
