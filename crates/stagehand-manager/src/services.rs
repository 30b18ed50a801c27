//! Default collaborator implementations.

use async_trait::async_trait;
use stagehand_core::services::{
    ConfigArgs, ConfigService, ConvertService, NetrcService, StatusInput, StatusService,
};
use stagehand_core::{Config, Error, Netrc, Repository, Result, User};
use std::path::PathBuf;
use tracing::debug;

/// Pipeline file used when a repository does not name one.
pub const DEFAULT_CONFIG_PATH: &str = ".stagehand.yml";

/// Password paired with a token login for HTTPS clones.
const TOKEN_PASSWORD: &str = "x-oauth-basic";

/// Derives clone credentials from the repository owner's SCM token.
#[derive(Debug, Clone, Default)]
pub struct TokenNetrcService {
    /// Hand out credentials for public repositories too, for SCM instances
    /// that require authentication for every clone.
    pub private_mode: bool,
}

impl TokenNetrcService {
    pub fn new(private_mode: bool) -> Self {
        Self { private_mode }
    }
}

#[async_trait]
impl NetrcService for TokenNetrcService {
    async fn create(&self, user: &User, repo: &Repository) -> Result<Option<Netrc>> {
        if !repo.private && !self.private_mode {
            return Ok(None);
        }
        let clone_url = url::Url::parse(&repo.http_url)
            .map_err(|e| Error::InvalidInput(format!("clone url {}: {e}", repo.http_url)))?;
        let machine = clone_url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("clone url {} has no host", repo.http_url)))?;
        Ok(Some(Netrc {
            machine: machine.to_string(),
            login: user.token.clone(),
            password: TOKEN_PASSWORD.to_string(),
        }))
    }
}

/// Reads pipeline files from `<root>/<namespace>/<name>/<config path>`.
#[derive(Debug, Clone)]
pub struct DirectoryConfigService {
    root: PathBuf,
}

impl DirectoryConfigService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ConfigService for DirectoryConfigService {
    async fn find(&self, args: &ConfigArgs<'_>) -> Result<Config> {
        let file = if args.repo.config.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            args.repo.config.as_str()
        };
        let path = self
            .root
            .join(&args.repo.namespace)
            .join(&args.repo.name)
            .join(file);
        debug!(path = %path.display(), "Reading pipeline configuration");
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("configuration {}", path.display()))
            }
            _ => Error::Internal(format!("reading {}: {e}", path.display())),
        })?;
        Ok(Config {
            data,
            kind: String::new(),
        })
    }
}

/// Leaves configuration untouched.
#[derive(Debug, Clone, Default)]
pub struct PassthroughConverter;

#[async_trait]
impl ConvertService for PassthroughConverter {
    async fn convert(&self, _args: &ConfigArgs<'_>, config: Config) -> Result<Config> {
        Ok(config)
    }
}

/// For SCM providers without commit status support.
#[derive(Debug, Clone, Default)]
pub struct NoopStatus;

#[async_trait]
impl StatusService for NoopStatus {
    async fn send(&self, _user: &User, _input: &StatusInput<'_>) -> Result<()> {
        Err(Error::NotSupported)
    }
}
