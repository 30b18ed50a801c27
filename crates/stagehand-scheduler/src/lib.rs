//! Stage scheduling for Stagehand.
//!
//! Holds ready stages until an agent with a matching filter asks for one, and
//! tracks build cancellation signals for long-polling watchers. The store
//! stays the source of truth: the queue is periodically reconciled with its
//! unclaimed pending stages.

pub mod queue;

pub use queue::{MemoryQueue, QueueConfig, match_resource, matches};
