//! Request and reply bodies.
//!
//! Steps and stages travel as themselves; everything else is wrapped so the
//! body stays a JSON object that can grow fields.

use serde::{Deserialize, Serialize};
use stagehand_core::logs::Line;
use stagehand_core::{BuildId, Context, Filter, RepoId, StageId, StepId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestArgs {
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptArgs {
    pub stage: StageId,
    pub machine: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetrcArgs {
    pub repo: RepoId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailsArgs {
    pub stage: StageId,
}

/// The repository signing secret never serializes with the repository, so it
/// rides alongside the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailsReply {
    pub context: Context,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteArgs {
    pub step: StepId,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchArgs {
    pub build: BuildId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelArgs {
    pub build: BuildId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchReply {
    pub done: bool,
}

/// Query string of the upload endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepQuery {
    pub id: StepId,
}
