//! Repository, owner and system types.

use serde::{Deserialize, Serialize};

use crate::{RepoId, UserId};

/// A source repository builds are run for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    /// The user whose credentials are used to talk to the SCM.
    pub user_id: UserId,
    pub namespace: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub scm: String,
    #[serde(default)]
    pub http_url: String,
    #[serde(default)]
    pub ssh_url: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub active: bool,
    /// Path of the pipeline configuration file inside the repository.
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub protected: bool,
    /// Stage timeout in minutes.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub counter: i64,
    /// Signing secret. Never serialized with the repository; the RPC details
    /// response carries it separately.
    #[serde(skip)]
    pub secret: String,
    #[serde(default)]
    pub version: i64,
}

/// A user account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub active: bool,
    /// SCM access token.
    #[serde(skip)]
    pub token: String,
}

/// Clone credentials handed to an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Netrc {
    pub machine: String,
    pub login: String,
    pub password: String,
}

/// Information about the server instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub proto: String,
    pub host: String,
    pub link: String,
    pub version: String,
}
