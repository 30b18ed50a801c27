//! Administrative build cancellation.

use async_trait::async_trait;
use stagehand_core::services::{Pubsub, StatusService};
use stagehand_core::{BuildCanceler, BuildId, Result, Scheduler, Status, now};
use stagehand_db::Stores;
use std::sync::Arc;
use tracing::{info, warn};

use crate::notify;

/// Exit code recorded on steps killed by a cancellation.
const EXIT_CODE_KILLED: i32 = 130;

/// Kills a build and every stage that has not finished.
#[derive(Clone)]
pub struct Canceler {
    stores: Stores,
    scheduler: Arc<dyn Scheduler>,
    events: Arc<dyn Pubsub>,
    status: Arc<dyn StatusService>,
}

impl Canceler {
    pub fn new(
        stores: Stores,
        scheduler: Arc<dyn Scheduler>,
        events: Arc<dyn Pubsub>,
        status: Arc<dyn StatusService>,
    ) -> Self {
        Self {
            stores,
            scheduler,
            events,
            status,
        }
    }

    /// Kill the build. Finished builds are left untouched. Running agents
    /// learn about it through `watch` and report back through the usual
    /// step and stage calls.
    pub async fn cancel(&self, id: BuildId) -> Result<()> {
        let mut build = self.stores.builds.find(id).await?;
        if build.is_done() {
            info!(build.id = %id, status = %build.status, "Build already finished, nothing to cancel");
            return Ok(());
        }
        let repo = self.stores.repos.find(build.repo_id).await?;

        let killed = now();
        build.status = Status::Killed;
        build.finished = killed;
        build.updated = killed;
        if build.started == 0 {
            build.started = killed;
        }
        self.stores.builds.update(&mut build).await?;

        let mut stages = self.stores.stages.list_steps(id).await?;
        for stage in &mut stages {
            if stage.is_done() {
                continue;
            }
            stage.status = Status::Killed;
            if stage.started == 0 {
                stage.started = killed;
            }
            stage.stopped = killed;
            if let Err(err) = self.stores.stages.update(stage).await {
                warn!(stage.id = %stage.id, error = %err, "Cannot kill stage");
            }

            for step in &mut stage.steps {
                match step.status {
                    Status::Pending => {
                        step.status = Status::Skipped;
                        step.started = killed;
                    }
                    Status::Running => {
                        step.status = Status::Killed;
                        step.exit_code = EXIT_CODE_KILLED;
                    }
                    _ => continue,
                }
                step.stopped = killed;
                if let Err(err) = self.stores.steps.update(step).await {
                    warn!(step.id = %step.id, error = %err, "Cannot kill step");
                }
            }
        }

        if let Err(err) = self.scheduler.cancel(id).await {
            warn!(build.id = %id, error = %err, "Cannot signal build cancellation");
        }
        info!(build.id = %id, repo = %repo.slug, "Build cancelled");

        build.stages = stages;
        notify::publish(self.events.as_ref(), &repo, &build).await;
        notify::send_status(
            self.stores.users.as_ref(),
            self.status.as_ref(),
            &repo,
            &build,
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl BuildCanceler for Canceler {
    async fn cancel(&self, build: BuildId) -> Result<()> {
        Canceler::cancel(self, build).await
    }
}
