//! Log lines and step cards.

use serde::{Deserialize, Serialize};

/// A single line of step output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    #[serde(rename = "pos")]
    pub number: i64,
    #[serde(rename = "out")]
    pub message: String,
    /// Seconds since the step started.
    #[serde(rename = "time")]
    pub timestamp: i64,
}

/// A structured card a step may publish alongside its logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardInput {
    #[serde(default)]
    pub schema: String,
    pub data: serde_json::Value,
}
