//! Steps: one executable unit within a stage.

use serde::{Deserialize, Serialize};

use crate::{StageId, Status, StepId};

/// Exit code a step uses to end its stage early without failing it.
pub const EXIT_CODE_SKIP_REMAINING: i32 = 78;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub stage_id: StageId,
    pub number: i64,
    pub name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub errignore: bool,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub started: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stopped: i64,
    pub version: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl Step {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }
}
