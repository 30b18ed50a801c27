//! Remote procedure calls between build agents and the Stagehand server.
//!
//! Every [`BuildManager`](stagehand_core::BuildManager) operation maps to one
//! `POST /rpc/v1/<operation>` call authenticated with a shared secret. The
//! [`server`] exposes any manager over HTTP and the [`client`] implements the
//! same trait on top of it, so agents run unchanged in-process or remote.
//! Build cancellation rides on the same transport as `POST /rpc/v1/cancel`.
//!
//! Status codes carry meaning on this protocol:
//! - `204` success without a payload
//! - `409` optimistic lock conflict
//! - `524` long-poll deadline reached with nothing to report
//! - `400` the call named a missing record or carried invalid input
//! - any other status above `299` is a server error

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientConfig, RetryPolicy};
pub use error::RpcError;
pub use server::{RpcState, ServerConfig, router};

/// Header carrying the shared secret.
pub const TOKEN_HEADER: &str = "X-Stagehand-Token";

/// Prefix every RPC endpoint is mounted under.
pub const RPC_PREFIX: &str = "/rpc/v1";

/// Non-standard status signalling an expired long-poll.
pub const STATUS_DEADLINE: u16 = 524;
