//! Step progress handling.

use stagehand_core::services::Pubsub;
use stagehand_core::{Result, Step, truncate_error};
use stagehand_db::Stores;
use tracing::warn;

use crate::notify;

pub(crate) struct Updater<'a> {
    pub stores: &'a Stores,
    pub events: &'a dyn Pubsub,
}

impl Updater<'_> {
    /// Persist the step, creating it when it has no id yet, then publish the
    /// refreshed build.
    pub async fn run(&self, step: &mut Step) -> Result<()> {
        truncate_error(&mut step.error);
        let saved = if step.id.is_set() {
            self.stores.steps.update(step).await
        } else {
            self.stores.steps.create(step).await
        };
        saved.inspect_err(|e| warn!(step.name = %step.name, error = %e, "Cannot persist step"))?;

        let stage = self.stores.stages.find(step.stage_id).await?;
        let mut build = self.stores.builds.find(stage.build_id).await?;
        let repo = self.stores.repos.find(build.repo_id).await?;
        build.stages = self.stores.stages.list_steps(build.id).await?;

        notify::publish(self.events, &repo, &build).await;
        Ok(())
    }
}
