//! The execution backend a runner drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_core::{Context, Netrc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// When a step runs relative to the outcome of the steps before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
    /// Compiled out; never registered with the server.
    Never,
}

/// One executable step of a compiled stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub policy: RunPolicy,
    /// A failure of this step does not fail the stage.
    #[serde(default)]
    pub errignore: bool,
}

/// A stage compiled for execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<StepSpec>,
}

impl Plan {
    /// Steps that take part in the run, in order.
    pub fn runnable(&self) -> impl Iterator<Item = &StepSpec> {
        self.steps.iter().filter(|s| s.policy != RunPolicy::Never)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// A step exited non-zero.
    #[error("exit code {0}")]
    Exit(i32),

    #[error("OOM kill signaled by host operating system")]
    Oom,

    #[error("{0}")]
    Other(String),
}

/// Executes compiled steps, typically in containers.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Turn the stage configuration into a plan.
    async fn compile(&self, ctx: &Context, netrc: Option<&Netrc>) -> Result<Plan, EngineError>;

    /// Run one step to completion and return its exit code. Output is sent
    /// line by line on `output`; the step is considered finished once this
    /// returns. Dropping the future must stop the step.
    async fn run_step(
        &self,
        step: &StepSpec,
        output: mpsc::Sender<String>,
    ) -> Result<i32, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_steps_not_runnable() {
        let plan = Plan {
            steps: vec![
                StepSpec {
                    name: "clone".into(),
                    ..Default::default()
                },
                StepSpec {
                    name: "disabled".into(),
                    policy: RunPolicy::Never,
                    ..Default::default()
                },
                StepSpec {
                    name: "notify".into(),
                    policy: RunPolicy::Always,
                    ..Default::default()
                },
            ],
        };
        let names: Vec<_> = plan.runnable().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["clone", "notify"]);
    }

    #[test]
    fn test_step_spec_defaults() {
        let spec: StepSpec = serde_json::from_str(r#"{"name":"test","policy":"on_failure"}"#).unwrap();
        assert_eq!(spec.policy, RunPolicy::OnFailure);
        assert!(!spec.errignore);
        assert!(spec.commands.is_empty());
    }
}
