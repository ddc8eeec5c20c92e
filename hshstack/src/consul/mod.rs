//! Operations against a running Consul cluster.
//!
//! [`Consul`] is the seam between the bootstrap logic and the live control plane:
//! [`ConsulHttpClient`] talks to the HTTPS API of the first consul server, tests use a
//! recording double instead.

mod http;
#[cfg(test)]
pub mod testing;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use http::ConsulHttpClient;

/// Accessor ID of the token Consul uses for requests that carry no token.
pub const ANONYMOUS_TOKEN_ACCESSOR: &str = "00000000-0000-0000-0000-000000000002";

#[derive(Error, Debug)]
pub enum ConsulError {
    #[error("No hosts found in the '{0}' inventory group")]
    NoServersFound(String),
    #[error("Consul ACLs have already been bootstrapped")]
    AlreadyBootstrapped,
    #[error("Consul API error {0}: {1}")]
    Api(reqwest::StatusCode, String),
    #[error("Failed to reach Consul: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON definition in {path}: {source}")]
    InvalidDefinition {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait Consul: Send + Sync {
    /// Uses `token` for every following request. Until then requests are anonymous.
    fn authenticate(&mut self, token: &str);

    /// Bootstraps the ACL system and returns the bootstrap token, which is also used
    /// for the following requests.
    ///
    /// Consul allows this once, later calls fail with [`ConsulError::AlreadyBootstrapped`].
    async fn bootstrap(&mut self) -> Result<String, ConsulError>;

    /// Creates a policy with the rules in `rule_file`.
    async fn register_policy(&self, name: &str, rule_file: &Path) -> Result<(), ConsulError>;

    /// Replaces the rules of an existing policy, keeping its identity so tokens
    /// referencing it pick up the change.
    async fn update_policy(&self, name: &str, rule_file: &Path) -> Result<(), ConsulError>;

    /// Issues a new token bound to `policy_name` and returns its secret.
    async fn register_acl(&self, description: &str, policy_name: &str)
        -> Result<String, ConsulError>;

    /// Binds the existing token `principal_id` to `policy_name`.
    async fn update_acl(&self, principal_id: &str, policy_name: &str) -> Result<(), ConsulError>;

    async fn register_service(&self, service_file: &Path) -> Result<(), ConsulError>;

    async fn register_intention(&self, intention_file: &Path) -> Result<(), ConsulError>;
}
