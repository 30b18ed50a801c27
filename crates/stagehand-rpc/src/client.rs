//! HTTP client implementing `BuildManager` against a remote server.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stagehand_core::logs::{CardInput, Line};
use stagehand_core::{
    BuildCanceler, BuildId, BuildManager, Context, Error, Filter, Netrc, RepoId, Result, Stage, StageId, Step,
    StepId,
};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::protocol::{
    AcceptArgs, CancelArgs, DetailsArgs, DetailsReply, NetrcArgs, RequestArgs, StepQuery, WatchArgs,
    WatchReply, WriteArgs,
};
use crate::{RPC_PREFIX, STATUS_DEADLINE, TOKEN_HEADER};

const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";

/// Bounded exponential backoff for transport failures and 5xx replies.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt`, counting from zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base address, e.g. `http://ci.example.com`.
    pub address: String,
    pub secret: String,
    pub retry: RetryPolicy,
    /// Per-attempt timeout. Must exceed the server's long-poll deadline.
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            secret: secret.into(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of a call that did not fail.
enum Reply {
    Empty,
    Deadline,
    Body(Bytes),
}

/// Talks to a remote manager over the RPC protocol.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    secret: String,
    retry: RetryPolicy,
}

impl Client {
    /// Create a client. A blank secret is rejected up front since the server
    /// would refuse every call.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(Error::Unauthorized("rpc secret is not configured".into()));
        }
        let address = Url::parse(&config.address)
            .map_err(|e| Error::InvalidInput(format!("rpc address {}: {e}", config.address)))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}{RPC_PREFIX}", address.as_str().trim_end_matches('/')),
            secret: config.secret,
            retry: config.retry,
        })
    }

    async fn post<T: Serialize>(&self, op: &str, args: &T, retry: bool) -> Result<Reply> {
        let body = serde_json::to_vec(args)
            .map_err(|e| Error::InvalidInput(format!("encode {op} request: {e}")))?;
        self.call(op, None, JSON, Bytes::from(body), retry).await
    }

    async fn call(
        &self,
        op: &str,
        step: Option<StepId>,
        content_type: &'static str,
        body: Bytes,
        retry: bool,
    ) -> Result<Reply> {
        let url = format!("{}/{op}", self.endpoint);
        let attempts = if retry { self.retry.attempts.max(1) } else { 1 };
        let mut attempt = 0;
        loop {
            match self.send(&url, step, content_type, body.clone()).await {
                Err(err) if attempt + 1 < attempts && is_retryable(&err) => {
                    let delay = self.retry.backoff(attempt);
                    debug!(op, attempt, error = %err, ?delay, "Retrying RPC call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn send(
        &self,
        url: &str,
        step: Option<StepId>,
        content_type: &'static str,
        body: Bytes,
    ) -> Result<Reply> {
        let mut request = self
            .http
            .post(url)
            .header(TOKEN_HEADER, &self.secret)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        if let Some(id) = step {
            request = request.query(&StepQuery { id });
        }

        let response = request.send().await.map_err(transport_error)?;
        match response.status().as_u16() {
            204 => Ok(Reply::Empty),
            409 => Err(Error::OptimisticLock),
            STATUS_DEADLINE => Ok(Reply::Deadline),
            401 => Err(Error::Unauthorized(error_message(response).await)),
            status if status > 299 => Err(Error::Server {
                status,
                message: error_message(response).await,
            }),
            _ => {
                let bytes = response.bytes().await.map_err(transport_error)?;
                if bytes.is_empty() {
                    Ok(Reply::Empty)
                } else {
                    Ok(Reply::Body(bytes))
                }
            }
        }
    }
}

#[async_trait]
impl BuildCanceler for Client {
    /// Ask the server to kill a build. Needs a server that was given a
    /// canceler; others answer with a 400.
    async fn cancel(&self, build: BuildId) -> Result<()> {
        self.post("cancel", &CancelArgs { build }, true).await?;
        Ok(())
    }
}

fn decode<R: DeserializeOwned>(op: &str, reply: Reply) -> Result<R> {
    match reply {
        Reply::Body(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| Error::Internal(format!("decode {op} reply: {e}"))),
        Reply::Empty | Reply::Deadline => Err(Error::Internal(format!("{op} returned no body"))),
    }
}

/// A client-side timeout is final; retrying it would only stack up polls.
fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::DeadlineExceeded
    } else {
        Error::Transport(err.to_string())
    }
}

fn is_retryable(err: &Error) -> bool {
    matches!(
        err,
        Error::Transport(_)
            | Error::Server {
                status: 500..=599,
                ..
            }
    )
}

async fn error_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(text)
}

#[async_trait]
impl BuildManager for Client {
    async fn request(&self, filter: &Filter) -> Result<Option<Stage>> {
        let args = RequestArgs {
            filter: filter.clone(),
        };
        match self.post("request", &args, true).await {
            Ok(reply @ Reply::Body(_)) => decode("request", reply).map(Some),
            Ok(Reply::Empty | Reply::Deadline) => Ok(None),
            Err(err) if err.is_deadline() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn accept(&self, id: StageId, machine: &str) -> Result<Stage> {
        let args = AcceptArgs {
            stage: id,
            machine: machine.to_string(),
        };
        decode("accept", self.post("accept", &args, true).await?)
    }

    async fn netrc(&self, id: RepoId) -> Result<Option<Netrc>> {
        match self.post("netrc", &NetrcArgs { repo: id }, true).await? {
            reply @ Reply::Body(_) => decode("netrc", reply),
            Reply::Empty | Reply::Deadline => Ok(None),
        }
    }

    async fn details(&self, id: StageId) -> Result<Context> {
        let reply: DetailsReply = decode(
            "details",
            self.post("details", &DetailsArgs { stage: id }, true).await?,
        )?;
        let mut context = reply.context;
        context.repository.secret = reply.secret;
        Ok(context)
    }

    async fn before(&self, step: &mut Step) -> Result<()> {
        let updated: Step = decode("before", self.post("before", &*step, true).await?)?;
        *step = updated;
        Ok(())
    }

    async fn after(&self, step: &mut Step) -> Result<()> {
        let updated: Step = decode("after", self.post("after", &*step, true).await?)?;
        *step = updated;
        Ok(())
    }

    async fn before_all(&self, stage: &mut Stage) -> Result<()> {
        let updated: Stage = decode("beforeAll", self.post("beforeAll", &*stage, true).await?)?;
        *stage = updated;
        Ok(())
    }

    async fn after_all(&self, stage: &mut Stage) -> Result<()> {
        let updated: Stage = decode("afterAll", self.post("afterAll", &*stage, true).await?)?;
        *stage = updated;
        Ok(())
    }

    async fn watch(&self, id: BuildId) -> Result<bool> {
        match self.post("watch", &WatchArgs { build: id }, true).await {
            Ok(reply @ Reply::Body(_)) => {
                let reply: WatchReply = decode("watch", reply)?;
                Ok(reply.done)
            }
            Ok(Reply::Empty | Reply::Deadline) => Ok(false),
            Err(err) if err.is_deadline() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn write(&self, step: StepId, line: &Line) -> Result<()> {
        let args = WriteArgs {
            step,
            line: line.clone(),
        };
        // a lost live line is acceptable, a duplicated one is not
        self.post("write", &args, false).await?;
        Ok(())
    }

    async fn upload(&self, step: StepId, data: Bytes) -> Result<()> {
        self.call("upload", Some(step), OCTET_STREAM, data, true)
            .await?;
        Ok(())
    }

    async fn upload_card(&self, step: StepId, card: &CardInput) -> Result<()> {
        let body = serde_json::to_vec(card)
            .map_err(|e| Error::InvalidInput(format!("encode card: {e}")))?;
        self.call("card", Some(step), JSON, Bytes::from(body), true)
            .await?;
        Ok(())
    }
}
