//! Execution status shared by builds, stages and steps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a build, stage or step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Queued, waiting for an agent.
    #[default]
    #[serde(rename = "pending")]
    Pending,
    /// Currently executing.
    #[serde(rename = "running")]
    Running,
    /// Waiting for upstream stages to settle.
    #[serde(rename = "waiting_on_dependencies")]
    Waiting,
    /// Waiting for approval.
    #[serde(rename = "blocked")]
    Blocked,
    /// Approval was declined.
    #[serde(rename = "declined")]
    Declined,
    /// Not executed because a condition was not met.
    #[serde(rename = "skipped")]
    Skipped,
    /// Cancelled by a user.
    #[serde(rename = "killed")]
    Killed,
    #[serde(rename = "failure")]
    Failing,
    #[serde(rename = "success")]
    Passing,
    /// Could not be executed at all.
    #[serde(rename = "error")]
    Error,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Pending,
        Status::Running,
        Status::Waiting,
        Status::Blocked,
        Status::Declined,
        Status::Skipped,
        Status::Killed,
        Status::Failing,
        Status::Passing,
        Status::Error,
    ];

    /// Whether the status is settled. Pending, Running, Waiting, Blocked and
    /// Declined are not.
    pub fn is_done(&self) -> bool {
        !matches!(
            self,
            Status::Pending | Status::Running | Status::Waiting | Status::Blocked | Status::Declined
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Status::Failing | Status::Killed | Status::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Waiting => "waiting_on_dependencies",
            Status::Blocked => "blocked",
            Status::Declined => "declined",
            Status::Skipped => "skipped",
            Status::Killed => "killed",
            Status::Failing => "failure",
            Status::Passing => "success",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown status: {}", s)))
    }
}
