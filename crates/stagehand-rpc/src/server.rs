//! Exposes a `BuildManager` over HTTP.

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use stagehand_core::logs::CardInput;
use stagehand_core::{BuildCanceler, BuildManager, Error, Netrc, Stage, Step};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::protocol::{
    AcceptArgs, CancelArgs, DetailsArgs, DetailsReply, NetrcArgs, RequestArgs, StepQuery, WatchArgs,
    WatchReply, WriteArgs,
};
use crate::{RPC_PREFIX, TOKEN_HEADER};

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Shared secret agents must present. An empty secret rejects every call.
    pub secret: String,
    /// Upper bound on a `request` long-poll.
    pub request_timeout: Duration,
    /// Upper bound on a `watch` long-poll.
    pub watch_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            request_timeout: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct RpcState {
    manager: Arc<dyn BuildManager>,
    canceler: Option<Arc<dyn BuildCanceler>>,
    config: Arc<ServerConfig>,
}

impl RpcState {
    pub fn new(manager: Arc<dyn BuildManager>, config: ServerConfig) -> Self {
        Self {
            manager,
            canceler: None,
            config: Arc::new(config),
        }
    }

    /// Serve `cancel`. Without a canceler the operation is not supported.
    pub fn with_canceler(mut self, canceler: Arc<dyn BuildCanceler>) -> Self {
        self.canceler = Some(canceler);
        self
    }
}

/// Build the RPC router: the authenticated operations under `/rpc/v1` plus
/// an unauthenticated `/healthz`.
pub fn router(state: RpcState) -> Router {
    let rpc = Router::new()
        .route("/request", post(request))
        .route("/accept", post(accept))
        .route("/netrc", post(netrc))
        .route("/details", post(details))
        .route("/before", post(before))
        .route("/after", post(after))
        .route("/beforeAll", post(before_all))
        .route("/afterAll", post(after_all))
        .route("/write", post(write))
        .route("/upload", post(upload))
        .route("/card", post(card))
        .route("/watch", post(watch))
        .route("/cancel", post(cancel))
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize));

    Router::new()
        .nest(RPC_PREFIX, rpc)
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn authorize(
    State(state): State<RpcState>,
    request: Request,
    next: Next,
) -> Result<Response, RpcError> {
    let token = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.config.secret.is_empty() || token != state.config.secret {
        warn!(path = %request.uri().path(), "Rejected RPC call with invalid token");
        return Err(RpcError::Unauthorized);
    }
    Ok(next.run(request).await)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn request(
    State(state): State<RpcState>,
    Json(args): Json<RequestArgs>,
) -> Result<Json<Stage>, RpcError> {
    let polled = timeout(
        state.config.request_timeout,
        state.manager.request(&args.filter),
    )
    .await;
    match polled {
        Ok(Ok(Some(stage))) => Ok(Json(stage)),
        Ok(Ok(None)) | Err(_) => {
            debug!(os = %args.filter.os, arch = %args.filter.arch, "No stage for agent");
            Err(Error::DeadlineExceeded.into())
        }
        Ok(Err(err)) => Err(err.into()),
    }
}

async fn accept(
    State(state): State<RpcState>,
    Json(args): Json<AcceptArgs>,
) -> Result<Json<Stage>, RpcError> {
    let stage = state.manager.accept(args.stage, &args.machine).await?;
    Ok(Json(stage))
}

async fn netrc(
    State(state): State<RpcState>,
    Json(args): Json<NetrcArgs>,
) -> Result<Json<Option<Netrc>>, RpcError> {
    Ok(Json(state.manager.netrc(args.repo).await?))
}

async fn details(
    State(state): State<RpcState>,
    Json(args): Json<DetailsArgs>,
) -> Result<Json<DetailsReply>, RpcError> {
    let context = state.manager.details(args.stage).await?;
    let secret = context.repository.secret.clone();
    Ok(Json(DetailsReply { context, secret }))
}

async fn before(
    State(state): State<RpcState>,
    Json(mut step): Json<Step>,
) -> Result<Json<Step>, RpcError> {
    state.manager.before(&mut step).await?;
    Ok(Json(step))
}

async fn after(
    State(state): State<RpcState>,
    Json(mut step): Json<Step>,
) -> Result<Json<Step>, RpcError> {
    state.manager.after(&mut step).await?;
    Ok(Json(step))
}

async fn before_all(
    State(state): State<RpcState>,
    Json(mut stage): Json<Stage>,
) -> Result<Json<Stage>, RpcError> {
    state.manager.before_all(&mut stage).await?;
    Ok(Json(stage))
}

async fn after_all(
    State(state): State<RpcState>,
    Json(mut stage): Json<Stage>,
) -> Result<Json<Stage>, RpcError> {
    state.manager.after_all(&mut stage).await?;
    Ok(Json(stage))
}

async fn write(
    State(state): State<RpcState>,
    Json(args): Json<WriteArgs>,
) -> Result<StatusCode, RpcError> {
    state.manager.write(args.step, &args.line).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload(
    State(state): State<RpcState>,
    Query(query): Query<StepQuery>,
    body: Bytes,
) -> Result<StatusCode, RpcError> {
    state.manager.upload(query.id, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn card(
    State(state): State<RpcState>,
    Query(query): Query<StepQuery>,
    Json(card): Json<CardInput>,
) -> Result<StatusCode, RpcError> {
    state.manager.upload_card(query.id, &card).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn watch(
    State(state): State<RpcState>,
    Json(args): Json<WatchArgs>,
) -> Result<Json<WatchReply>, RpcError> {
    match timeout(state.config.watch_timeout, state.manager.watch(args.build)).await {
        Ok(Ok(done)) => Ok(Json(WatchReply { done })),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::DeadlineExceeded.into()),
    }
}

async fn cancel(
    State(state): State<RpcState>,
    Json(args): Json<CancelArgs>,
) -> Result<StatusCode, RpcError> {
    let canceler = state.canceler.as_ref().ok_or(Error::NotSupported)?;
    canceler.cancel(args.build).await?;
    Ok(StatusCode::NO_CONTENT)
}
