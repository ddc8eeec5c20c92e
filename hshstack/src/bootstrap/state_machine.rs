use std::fmt::Display;

use strum::{EnumIter, IntoEnumIterator};

use super::BootstrapError;
use crate::{
    consul::{Consul, ConsulError, ANONYMOUS_TOKEN_ACCESSOR},
    render::{ConsulPolicy, RenderedPolicies},
    secrets::{AclToken, SecretsRecord, SecretsStore},
};

/// Tokens issued during bootstrap, with the policy each one is bound to.
const ISSUED_TOKENS: [(AclToken, ConsulPolicy, &str); 4] = [
    (
        AclToken::Agent,
        ConsulPolicy::Agent,
        "Agent token for the cluster nodes",
    ),
    (
        AclToken::NomadClient,
        ConsulPolicy::NomadClient,
        "Consul token for the nomad clients",
    ),
    (
        AclToken::NomadServer,
        ConsulPolicy::NomadServer,
        "Consul token for the nomad servers",
    ),
    (
        AclToken::Prometheus,
        ConsulPolicy::Prometheus,
        "Consul token for prometheus",
    ),
];

/// Steps of a first time ACL bootstrap, executed in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter)]
pub enum BootstrapStep {
    BootstrapAcl,
    RegisterPolicies,
    /// Lets requests without a token discover services and nodes
    BindAnonymousPolicy,
    IssueTokens,
    /// The only step that writes to disk
    PersistSecrets,
}

impl Display for BootstrapStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootstrapStep::BootstrapAcl => write!(f, "Bootstrap ACL"),
            BootstrapStep::RegisterPolicies => write!(f, "Register Policies"),
            BootstrapStep::BindAnonymousPolicy => write!(f, "Bind Anonymous Policy"),
            BootstrapStep::IssueTokens => write!(f, "Issue Tokens"),
            BootstrapStep::PersistSecrets => write!(f, "Persist Secrets"),
        }
    }
}

pub struct BootstrapState<'a, C> {
    pub consul: &'a mut C,
    pub store: &'a SecretsStore,
    pub policies: &'a RenderedPolicies,
    /// Held in memory until every step has succeeded
    pub record: SecretsRecord,
    /// Set once Consul has handed out the bootstrap token
    pub bootstrap_token: Option<String>,
}

impl BootstrapStep {
    /// Execute the current step
    pub async fn execute<C: Consul>(
        &self,
        state: &mut BootstrapState<'_, C>,
    ) -> Result<(), BootstrapError> {
        let remote = |source: ConsulError| BootstrapError::Remote {
            step: *self,
            source,
        };

        match self {
            BootstrapStep::BootstrapAcl => match state.consul.bootstrap().await {
                Ok(token) => {
                    state.bootstrap_token = Some(token.clone());
                    state.record.issue(AclToken::Bootstrap, token)?;
                }
                Err(ConsulError::AlreadyBootstrapped) => {
                    return Err(BootstrapError::AlreadyBootstrappedInconsistency {
                        secrets_path: state.store.path().to_owned(),
                    });
                }
                Err(error) => return Err(remote(error)),
            },
            BootstrapStep::RegisterPolicies => {
                for policy in ConsulPolicy::iter() {
                    tracing::debug!("Registering policy {policy}");
                    state
                        .consul
                        .register_policy(policy.name(), &state.policies.path(policy))
                        .await
                        .map_err(remote)?;
                }
            }
            BootstrapStep::BindAnonymousPolicy => {
                state
                    .consul
                    .update_acl(ANONYMOUS_TOKEN_ACCESSOR, ConsulPolicy::Anonymous.name())
                    .await
                    .map_err(remote)?;
            }
            BootstrapStep::IssueTokens => {
                for (token, policy, description) in ISSUED_TOKENS {
                    tracing::debug!("Issuing {token} bound to {policy}");
                    let value = state
                        .consul
                        .register_acl(description, policy.name())
                        .await
                        .map_err(remote)?;

                    state.record.issue(token, value)?;
                }
            }
            BootstrapStep::PersistSecrets => {
                state.store.persist(&state.record)?;
            }
        }

        Ok(())
    }
}
