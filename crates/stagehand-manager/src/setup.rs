//! Stage start handling.

use stagehand_core::services::{Pubsub, StatusService};
use stagehand_core::{Build, Result, Stage, Status, now, truncate_error};
use stagehand_db::{DbError, Stores};
use tracing::{debug, info, warn};

use crate::notify;

pub(crate) struct Setup<'a> {
    pub stores: &'a Stores,
    pub events: &'a dyn Pubsub,
    pub status: &'a dyn StatusService,
}

impl Setup<'_> {
    /// Mark the stage running and persist its steps. Failing to persist the
    /// stage aborts the start; notifications afterwards are best-effort.
    pub async fn run(&self, stage: &mut Stage) -> Result<()> {
        let mut build = self
            .stores
            .builds
            .find(stage.build_id)
            .await
            .inspect_err(|e| warn!(stage.id = %stage.id, error = %e, "Cannot find build"))?;
        let repo = self
            .stores
            .repos
            .find(build.repo_id)
            .await
            .inspect_err(|e| warn!(build.id = %build.id, error = %e, "Cannot find repository"))?;

        let started = now();
        truncate_error(&mut stage.error);
        stage.status = Status::Running;
        if stage.started == 0 {
            stage.started = started;
        }
        stage.updated = started;
        self.stores
            .stages
            .update(stage)
            .await
            .inspect_err(|e| warn!(stage.id = %stage.id, error = %e, "Cannot update stage"))?;

        for step in &mut stage.steps {
            if step.id.is_set() {
                continue;
            }
            truncate_error(&mut step.error);
            step.stage_id = stage.id;
            self.stores
                .steps
                .create(step)
                .await
                .inspect_err(|e| warn!(step.name = %step.name, error = %e, "Cannot create step"))?;
        }

        info!(stage.id = %stage.id, stage.name = %stage.name, build.id = %build.id, "Stage started");

        let stages = self
            .stores
            .stages
            .list_steps(build.id)
            .await
            .inspect_err(|e| warn!(build.id = %build.id, error = %e, "Cannot list stages"))?;
        let build_started = self.start_build(&mut build).await?;
        build.stages = stages;

        notify::publish(self.events, &repo, &build).await;
        if build_started {
            notify::send_status(self.stores.users.as_ref(), self.status, &repo, &build).await;
        }
        Ok(())
    }

    /// Flip a pending build to running. Returns whether this call did it.
    async fn start_build(&self, build: &mut Build) -> Result<bool> {
        if build.status != Status::Pending {
            return Ok(false);
        }
        let started = now();
        build.status = Status::Running;
        build.started = started;
        build.updated = started;
        match self.stores.builds.update(build).await {
            Ok(()) => {
                info!(build.id = %build.id, build.number = build.number, "Build started");
                Ok(true)
            }
            Err(DbError::OptimisticLock) => {
                debug!(build.id = %build.id, "Build already started by another stage");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
