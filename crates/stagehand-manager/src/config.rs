//! Manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds for the long-polling operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long `request` waits for a matching stage.
    pub request_timeout: Duration,
    /// How long `watch` waits for a cancellation signal.
    pub watch_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(30),
        }
    }
}
