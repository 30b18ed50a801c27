//! Per-run table of the steps a stage reported to the server.
//!
//! Hooks look steps up by name, mutate them and hand a copy to the manager.
//! The lock is held only around each read-modify-write, never across a call
//! to the manager.

use stagehand_core::step::EXIT_CODE_SKIP_REMAINING;
use stagehand_core::{Status, Step, now};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub(crate) struct StepTable {
    steps: Mutex<HashMap<String, Step>>,
}

impl StepTable {
    pub fn new(steps: &[Step]) -> Self {
        let steps = steps.iter().map(|s| (s.name.clone(), s.clone())).collect();
        Self {
            steps: Mutex::new(steps),
        }
    }

    fn with<T>(&self, name: &str, f: impl FnOnce(&mut Step) -> T) -> Option<T> {
        let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
        steps.get_mut(name).map(f)
    }

    /// Mark the step running and return a copy to report.
    pub fn start(&self, name: &str) -> Option<Step> {
        self.with(name, |step| {
            step.status = Status::Running;
            step.started = now();
            step.clone()
        })
    }

    /// Record the exit code and return a copy to report. Exit code 78 ends
    /// the stage early without failing the step.
    pub fn finish(&self, name: &str, exit_code: i32) -> Option<Step> {
        self.with(name, |step| {
            step.exit_code = exit_code;
            step.stopped = now();
            step.status = if exit_code == 0 || exit_code == EXIT_CODE_SKIP_REMAINING {
                Status::Passing
            } else {
                Status::Failing
            };
            step.clone()
        })
    }

    /// Copy back what the server assigned.
    pub fn sync(&self, reported: &Step) {
        self.with(&reported.name, |step| {
            step.id = reported.id;
            step.version = reported.version;
        });
    }

    /// The steps ordered by number, with unfinished ones settled: pending
    /// steps are skipped and running steps pass as of now.
    pub fn settle(self) -> Vec<Step> {
        let stopped = now();
        let mut steps: Vec<Step> = self
            .steps
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_values()
            .collect();
        steps.sort_by_key(|s| s.number);
        settle(&mut steps, stopped);
        steps
    }
}

pub(crate) fn settle(steps: &mut [Step], stopped: i64) {
    for step in steps {
        match step.status {
            Status::Pending => step.status = Status::Skipped,
            Status::Running => {
                step.status = Status::Passing;
                step.stopped = stopped;
            }
            _ => {}
        }
    }
}
