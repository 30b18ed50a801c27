//! Stages: one phase of a build executed as a unit on one machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BuildId, RepoId, StageId, Status, Step};

/// A stage record.
///
/// `machine` is empty until an agent accepts the stage; a second claim must
/// fail with an optimistic-lock error. A stage with dependencies stays
/// `Waiting` until every named sibling is done.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    #[serde(default)]
    pub repo_id: RepoId,
    pub build_id: BuildId,
    pub number: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind_type: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub errignore: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub limit: i32,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub stopped: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    pub version: i64,
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Loaded on demand; never persisted with the stage row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl Stage {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }

    /// Whether `name` is one of this stage's declared dependencies.
    pub fn depends_on(&self, name: &str) -> bool {
        self.depends_on.iter().any(|dep| dep == name)
    }

    /// Copy the persisted bookkeeping of a freshly loaded row into this one,
    /// keeping identity and loaded steps.
    pub fn resync_from(&mut self, current: &Stage) {
        self.status = current.status;
        self.error = current.error.clone();
        self.exit_code = current.exit_code;
        self.machine = current.machine.clone();
        self.started = current.started;
        self.stopped = current.stopped;
        self.created = current.created;
        self.updated = current.updated;
        self.version = current.version;
    }
}
