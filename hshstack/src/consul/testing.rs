use std::{fs, path::Path, sync::Mutex};

use async_trait::async_trait;

use super::{Consul, ConsulError};

pub const BOOTSTRAP_TOKEN: &str = "bootstrap-token";

/// Token [`RecordingConsul`] issues for a policy.
pub fn token_for(policy_name: &str) -> String {
    format!("token-for-{policy_name}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsulCall {
    Authenticate(String),
    Bootstrap,
    RegisterPolicy { name: String, rules: String },
    UpdatePolicy { name: String, rules: String },
    RegisterAcl { description: String, policy_name: String },
    UpdateAcl { principal_id: String, policy_name: String },
    RegisterService(serde_json::Value),
    RegisterIntention(serde_json::Value),
}

type CallHook = Box<dyn Fn(&ConsulCall) + Send + Sync>;

/// In memory stand-in for a cluster which records every call made against it.
///
/// Like Consul it only allows a single bootstrap.
#[derive(Default)]
pub struct RecordingConsul {
    calls: Mutex<Vec<ConsulCall>>,
    bootstrapped: bool,
    failing_bootstrap: bool,
    failing_acl: Option<String>,
    on_call: Option<CallHook>,
}

impl RecordingConsul {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster whose ACL system was bootstrapped by someone else.
    pub fn already_bootstrapped() -> Self {
        Self {
            bootstrapped: true,
            ..Self::default()
        }
    }

    /// Fail the bootstrap itself with a server error.
    pub fn failing_bootstrap(mut self) -> Self {
        self.failing_bootstrap = true;
        self
    }

    /// Run `hook` on every call before it is answered.
    pub fn on_call(mut self, hook: impl Fn(&ConsulCall) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    /// Fail issuing a token for `policy_name`.
    pub fn failing_acl(mut self, policy_name: &str) -> Self {
        self.failing_acl = Some(policy_name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ConsulCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, predicate: impl Fn(&ConsulCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: ConsulCall) {
        if let Some(hook) = &self.on_call {
            hook(&call);
        }
        self.calls.lock().unwrap().push(call);
    }
}

fn read(path: &Path) -> Result<String, ConsulError> {
    fs::read_to_string(path).map_err(|source| ConsulError::Io {
        path: path.to_owned(),
        source,
    })
}

fn read_json(path: &Path) -> Result<serde_json::Value, ConsulError> {
    let contents = read(path)?;
    serde_json::from_str(&contents).map_err(|source| ConsulError::InvalidDefinition {
        path: path.to_owned(),
        source,
    })
}

#[async_trait]
impl Consul for RecordingConsul {
    fn authenticate(&mut self, token: &str) {
        self.record(ConsulCall::Authenticate(token.to_string()));
    }

    async fn bootstrap(&mut self) -> Result<String, ConsulError> {
        self.record(ConsulCall::Bootstrap);

        if self.failing_bootstrap {
            return Err(ConsulError::Api(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                "No cluster leader".to_string(),
            ));
        }
        if self.bootstrapped {
            return Err(ConsulError::AlreadyBootstrapped);
        }
        self.bootstrapped = true;

        Ok(BOOTSTRAP_TOKEN.to_string())
    }

    async fn register_policy(&self, name: &str, rule_file: &Path) -> Result<(), ConsulError> {
        self.record(ConsulCall::RegisterPolicy {
            name: name.to_string(),
            rules: read(rule_file)?,
        });
        Ok(())
    }

    async fn update_policy(&self, name: &str, rule_file: &Path) -> Result<(), ConsulError> {
        self.record(ConsulCall::UpdatePolicy {
            name: name.to_string(),
            rules: read(rule_file)?,
        });
        Ok(())
    }

    async fn register_acl(
        &self,
        description: &str,
        policy_name: &str,
    ) -> Result<String, ConsulError> {
        self.record(ConsulCall::RegisterAcl {
            description: description.to_string(),
            policy_name: policy_name.to_string(),
        });

        if self.failing_acl.as_deref() == Some(policy_name) {
            return Err(ConsulError::Api(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                "rpc error: leadership lost while committing log".to_string(),
            ));
        }

        Ok(token_for(policy_name))
    }

    async fn update_acl(&self, principal_id: &str, policy_name: &str) -> Result<(), ConsulError> {
        self.record(ConsulCall::UpdateAcl {
            principal_id: principal_id.to_string(),
            policy_name: policy_name.to_string(),
        });
        Ok(())
    }

    async fn register_service(&self, service_file: &Path) -> Result<(), ConsulError> {
        self.record(ConsulCall::RegisterService(read_json(service_file)?));
        Ok(())
    }

    async fn register_intention(&self, intention_file: &Path) -> Result<(), ConsulError> {
        self.record(ConsulCall::RegisterIntention(read_json(intention_file)?));
        Ok(())
    }
}
