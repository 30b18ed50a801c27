//! Build agent for Stagehand.
//!
//! A [`Runner`] keeps a pool of workers polling a
//! [`BuildManager`](stagehand_core::BuildManager) for stages. Each claimed
//! stage is compiled and executed step by step through an [`Engine`],
//! reporting progress back as it goes. Whether the manager is in-process or
//! behind the RPC client makes no difference here.

pub mod engine;
pub mod runner;
mod table;

pub use engine::{Engine, EngineError, Plan, RunPolicy, StepSpec};
pub use runner::{Runner, RunnerConfig};
