//! Build lifecycle management for Stagehand.
//!
//! The [`Manager`] implements every operation agents call while executing a
//! stage. Stage start and finish are delegated to setup and teardown, which
//! resolve the dependency graph between sibling stages and detect when a
//! build is complete.

pub mod canceler;
pub mod config;
pub mod livelog;
pub mod manager;
mod notify;
pub mod pubsub;
pub mod resolve;
pub mod services;
mod setup;
mod teardown;
mod updater;

#[cfg(test)]
mod testing;

pub use canceler::Canceler;
pub use config::ManagerConfig;
pub use livelog::LiveLog;
pub use manager::{Manager, Services};
pub use pubsub::Hub;
pub use services::{DirectoryConfigService, NoopStatus, PassthroughConverter, TokenNetrcService};
