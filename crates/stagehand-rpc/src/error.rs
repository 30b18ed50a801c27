//! Mapping manager errors onto the HTTP status contract.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use stagehand_core::Error;

use crate::STATUS_DEADLINE;

/// Error returned by RPC handlers.
#[derive(Debug)]
pub enum RpcError {
    Unauthorized,
    Manager(Error),
}

impl RpcError {
    pub fn status(&self) -> StatusCode {
        match self {
            RpcError::Unauthorized => StatusCode::UNAUTHORIZED,
            RpcError::Manager(err) => match err {
                Error::OptimisticLock => StatusCode::CONFLICT,
                Error::DeadlineExceeded | Error::Cancelled => {
                    StatusCode::from_u16(STATUS_DEADLINE).unwrap_or(StatusCode::GATEWAY_TIMEOUT)
                }
                Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                // 404 is reserved for unknown paths
                Error::NotFound(_) | Error::InvalidInput(_) | Error::NotSupported => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        RpcError::Manager(err)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            RpcError::Unauthorized => "invalid or missing token".to_string(),
            RpcError::Manager(err) => err.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
