//! Stage completion handling and downstream resolution.

use stagehand_core::services::{LogStream, Pubsub, StatusService};
use stagehand_core::{Error, Result, Scheduler, Stage, Status, now, truncate_error};
use stagehand_db::{DbError, Stores};
use tracing::{debug, info, warn};

use crate::{notify, resolve};

pub(crate) struct Teardown<'a> {
    pub stores: &'a Stores,
    pub scheduler: &'a dyn Scheduler,
    pub events: &'a dyn Pubsub,
    pub status: &'a dyn StatusService,
    pub logz: &'a dyn LogStream,
}

impl Teardown<'_> {
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

        for step in &mut stage.steps {
            truncate_error(&mut step.error);
            self.stores
                .steps
                .update(step)
                .await
                .inspect_err(|e| warn!(step.name = %step.name, error = %e, "Cannot update step"))?;
        }

        truncate_error(&mut stage.error);
        self.stores
            .stages
            .update(stage)
            .await
            .inspect_err(|e| warn!(stage.id = %stage.id, error = %e, "Cannot update stage"))?;

        for step in &stage.steps {
            if let Err(err) = self.logz.delete(step.id).await {
                debug!(step.id = %step.id, error = %err, "Cannot release log stream");
            }
        }

        info!(
            stage.id = %stage.id,
            stage.name = %stage.name,
            status = %stage.status,
            build.id = %build.id,
            "Stage finished"
        );

        let mut stages = self
            .stores
            .stages
            .list_steps(build.id)
            .await
            .inspect_err(|e| warn!(build.id = %build.id, error = %e, "Cannot list stages"))?;

        let mut errors = Vec::new();
        errors.extend(self.cancel_downstream(&mut stages).await);
        errors.extend(self.schedule_downstream(stage, &mut stages).await);
        if !errors.is_empty() {
            warn!(build.id = %build.id, count = errors.len(), "Cannot resolve downstream stages");
            return Error::from_many(errors);
        }

        if !resolve::is_build_complete(&stages) {
            return Ok(());
        }

        let finished = now();
        build.status = resolve::build_status(&stages);
        build.finished = finished;
        build.updated = finished;
        if build.started == 0 {
            build.started = finished;
        }
        match self.stores.builds.update(&mut build).await {
            Ok(()) => {}
            Err(DbError::OptimisticLock) => {
                debug!(build.id = %build.id, "Build already finalized by another stage");
                return Ok(());
            }
            Err(err) => {
                warn!(build.id = %build.id, error = %err, "Cannot update build");
                return Err(err.into());
            }
        }

        info!(build.id = %build.id, status = %build.status, "Build finished");

        build.stages = stages;
        notify::publish(self.events, &repo, &build).await;
        notify::send_status(self.stores.users.as_ref(), self.status, &repo, &build).await;
        Ok(())
    }

    /// Skip waiting stages whose success/failure gate no longer holds.
    async fn cancel_downstream(&self, stages: &mut [Stage]) -> Vec<Error> {
        let failed = resolve::any_failed(stages);
        let mut errors = Vec::new();

        for sibling in stages.iter_mut() {
            if !resolve::should_cancel(sibling, failed) {
                continue;
            }
            let skipped = now();
            sibling.status = Status::Skipped;
            sibling.started = skipped;
            sibling.stopped = skipped;

            match self.stores.stages.update(sibling).await {
                Ok(()) => debug!(stage.name = %sibling.name, "Skipped downstream stage"),
                Err(DbError::OptimisticLock) => {
                    debug!(stage.name = %sibling.name, "Downstream stage changed concurrently");
                    if let Err(err) = self.resync(sibling).await {
                        errors.push(err);
                    }
                }
                Err(err) => errors.push(err.into()),
            }
        }
        errors
    }

    /// Promote waiting stages for which `parent` was the last dependency to
    /// settle.
    async fn schedule_downstream(&self, parent: &Stage, stages: &mut [Stage]) -> Vec<Error> {
        let mut errors = Vec::new();

        for i in 0..stages.len() {
            if !resolve::should_schedule(parent, &stages[i], stages) {
                continue;
            }
            let sibling = &mut stages[i];
            sibling.status = Status::Pending;
            sibling.updated = now();

            match self.stores.stages.update(sibling).await {
                Ok(()) => {}
                Err(DbError::OptimisticLock) => {
                    debug!(stage.name = %sibling.name, "Downstream stage changed concurrently");
                    if let Err(err) = self.resync(sibling).await {
                        errors.push(err);
                    }
                    continue;
                }
                Err(err) => {
                    errors.push(err.into());
                    continue;
                }
            }

            info!(stage.id = %sibling.id, stage.name = %sibling.name, "Scheduling downstream stage");
            if let Err(err) = self.scheduler.schedule(sibling).await {
                warn!(stage.id = %sibling.id, error = %err, "Cannot schedule stage");
                errors.push(err);
            }
        }
        errors
    }

    /// Refresh an in-memory sibling after losing a write race.
    async fn resync(&self, stage: &mut Stage) -> Result<()> {
        let current = self.stores.stages.find(stage.id).await?;
        stage.resync_from(&current);
        Ok(())
    }
}
