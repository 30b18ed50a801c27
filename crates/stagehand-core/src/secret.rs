//! Pipeline secrets.

use serde::{Deserialize, Serialize};

use crate::{Event, RepoId};

/// A named secret exposed to pipeline steps. Repository secrets carry a
/// `repo_id`; organisation-wide secrets carry a `namespace` instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub repo_id: RepoId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    pub data: String,
    /// Whether the secret may be exposed to pull request builds.
    #[serde(default)]
    pub pull_request: bool,
    #[serde(default)]
    pub pull_request_push: bool,
}

impl Secret {
    /// Whether the secret may be handed to a build triggered by `event`.
    pub fn allowed_for(&self, event: Event) -> bool {
        self.pull_request || event != Event::PullRequest
    }
}

/// Keep the secrets a build triggered by `event` may see, in order.
pub fn filter_for_event(secrets: impl IntoIterator<Item = Secret>, event: Event) -> Vec<Secret> {
    secrets
        .into_iter()
        .filter(|secret| secret.allowed_for(event))
        .collect()
}
