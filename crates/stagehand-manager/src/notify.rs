//! Best-effort build notifications shared by the lifecycle handlers.

use stagehand_core::services::{Message, Pubsub, StatusInput, StatusService};
use stagehand_core::{Build, Error, Repository};
use stagehand_db::UserStore;
use tracing::warn;

/// Publish the build, including any loaded stages. Failures are logged.
pub(crate) async fn publish(events: &dyn Pubsub, repo: &Repository, build: &Build) {
    let message = match Message::for_build(repo, build) {
        Ok(message) => message,
        Err(err) => {
            warn!(build.id = %build.id, error = %err, "Cannot encode build event");
            return;
        }
    };
    if let Err(err) = events.publish(message).await {
        warn!(build.id = %build.id, repo = %repo.slug, error = %err, "Cannot publish build event");
    }
}

/// Report the build status to the SCM on behalf of the repository owner.
/// Providers without status support are ignored; other failures are logged.
pub(crate) async fn send_status(
    users: &dyn UserStore,
    status: &dyn StatusService,
    repo: &Repository,
    build: &Build,
) {
    let user = match users.find(repo.user_id).await {
        Ok(user) => user,
        Err(err) => {
            warn!(repo = %repo.slug, error = %err, "Cannot find repository owner");
            return;
        }
    };
    match status.send(&user, &StatusInput { repo, build }).await {
        Ok(()) | Err(Error::NotSupported) => {}
        Err(err) => {
            warn!(build.id = %build.id, repo = %repo.slug, error = %err, "Cannot send commit status");
        }
    }
}
