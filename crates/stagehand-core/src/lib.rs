//! Core domain types and traits for the Stagehand build orchestrator.
//!
//! This crate contains:
//! - Typed row identifiers and the shared error taxonomy
//! - Builds, stages, steps and their status lifecycle
//! - Repository, user, secret and log types
//! - The `BuildManager` interface agents talk to
//! - Capability traits for the scheduler and external collaborators

pub mod build;
pub mod error;
pub mod id;
pub mod logs;
pub mod manager;
pub mod repository;
pub mod scheduler;
pub mod secret;
pub mod services;
pub mod stage;
pub mod status;
pub mod step;

pub use build::{Build, Event};
pub use error::{Error, Result};
pub use id::{BuildId, RepoId, StageId, StepId, UserId};
pub use manager::{BuildCanceler, BuildManager, Config, Context, Filter};
pub use repository::{Netrc, Repository, System, User};
pub use scheduler::{QueueStats, Scheduler};
pub use secret::Secret;
pub use stage::Stage;
pub use status::Status;
pub use step::Step;

/// Maximum length of a persisted stage or step error message.
pub const MAX_ERROR_LEN: usize = 500;

/// Current time as unix seconds, the resolution every persisted timestamp uses.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Truncate an error message to [`MAX_ERROR_LEN`] characters in place.
pub fn truncate_error(message: &mut String) {
    if let Some((idx, _)) = message.char_indices().nth(MAX_ERROR_LEN) {
        message.truncate(idx);
    }
}
