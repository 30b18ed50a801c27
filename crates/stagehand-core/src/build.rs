//! Builds: one pipeline run triggered by a single event.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BuildId, RepoId, Stage, Status};

/// The event that triggered a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    #[default]
    Push,
    PullRequest,
    Tag,
    Promote,
    Rollback,
    Cron,
    Custom,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Push => "push",
            Event::PullRequest => "pull_request",
            Event::Tag => "tag",
            Event::Promote => "promote",
            Event::Rollback => "rollback",
            Event::Cron => "cron",
            Event::Custom => "custom",
        }
    }
}

impl std::str::FromStr for Event {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Event::Push),
            "pull_request" => Ok(Event::PullRequest),
            "tag" => Ok(Event::Tag),
            "promote" => Ok(Event::Promote),
            "rollback" => Ok(Event::Rollback),
            "cron" => Ok(Event::Cron),
            "custom" => Ok(Event::Custom),
            _ => Err(crate::Error::InvalidInput(format!("unknown event: {}", s))),
        }
    }
}

/// A build record.
///
/// The status is derived from the stages: the build is done once none of them
/// is pending, running, waiting, blocked or declined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repo_id: RepoId,
    #[serde(default)]
    pub trigger: String,
    pub number: i64,
    #[serde(default)]
    pub parent: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub event: Event,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub author_login: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deploy_to: String,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    pub version: i64,
    /// Loaded on demand; never persisted with the build row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
}

impl Build {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }
}
