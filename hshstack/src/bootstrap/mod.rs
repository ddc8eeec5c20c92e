//! Bootstrapping of the Consul ACL system.
//!
//! A cluster is bootstrapped exactly once. The first run bootstraps the ACL system,
//! registers the policies and issues the tokens the nodes need, then saves everything
//! in a single write. Every later run finds the bootstrap token in the secrets file and
//! only brings the cluster policy up to date with the inventory.

mod error;
mod state_machine;

use std::path::PathBuf;

use strum::IntoEnumIterator;

pub use error::BootstrapError;
pub use state_machine::BootstrapStep;
use state_machine::BootstrapState;

use crate::{
    config::Config,
    consul::{Consul, ConsulHttpClient},
    inventory::Inventory,
    render::{
        ConsulPolicy, NodeConfigRenderer, NodeConfigTemplates, PolicyRenderer, PolicyTemplates,
        RenderedPolicies,
    },
    secrets::{
        ensure_secrets,
        pki::{ensure_consul_certificates, ensure_nomad_certificates, ConsulCertificates},
        AclToken, ObjectStorageCredentials, SecretsError, SecretsRecord, SecretsStore,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The ACL system was bootstrapped by this run and tokens were issued
    Bootstrapped,
    /// The cluster was already bootstrapped, only the cluster policy was updated
    Reconciled,
}

impl BootstrapOutcome {
    /// The nodes need to be reconfigured with the newly issued tokens.
    pub fn has_bootstrapped(&self) -> bool {
        *self == BootstrapOutcome::Bootstrapped
    }
}

/// Runs the bootstrap or reconciliation against one cluster.
pub struct Orchestrator<'a, C> {
    consul: &'a mut C,
    store: &'a SecretsStore,
    policies: &'a RenderedPolicies,
}

impl<'a, C: Consul> Orchestrator<'a, C> {
    pub fn new(consul: &'a mut C, store: &'a SecretsStore, policies: &'a RenderedPolicies) -> Self {
        Self {
            consul,
            store,
            policies,
        }
    }

    /// `credentials` are only used when there is no secrets file yet, in which case a
    /// new record is generated and held in memory until bootstrapping succeeds.
    pub async fn run(
        self,
        credentials: Option<ObjectStorageCredentials>,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let record = match self.store.load()? {
            Some(record) => record,
            None => {
                let credentials = credentials.ok_or_else(|| {
                    SecretsError::MissingObjectStorageCredentials(self.store.path().to_owned())
                })?;
                tracing::warn!(
                    "No secrets found at {}, generating new ones",
                    self.store.path().display()
                );
                SecretsRecord::generate(credentials)
            }
        };

        if let Some(bootstrap_token) = record.token(AclToken::Bootstrap).map(str::to_owned) {
            return self.reconcile(&bootstrap_token).await;
        }

        self.bootstrap(record).await
    }

    async fn bootstrap(self, record: SecretsRecord) -> Result<BootstrapOutcome, BootstrapError> {
        tracing::info!("Bootstrapping the consul ACL system");

        let mut state = BootstrapState {
            consul: self.consul,
            store: self.store,
            policies: self.policies,
            record,
            bootstrap_token: None,
        };

        for step in BootstrapStep::iter() {
            tracing::info!("=== {step} ===");

            if let Err(error) = step.execute(&mut state).await {
                // Once consul has handed out the bootstrap token it will never do so again
                return Err(match state.bootstrap_token.take() {
                    Some(bootstrap_token) => BootstrapError::PartiallyBootstrapped {
                        step,
                        bootstrap_token,
                        source: Box::new(error),
                    },
                    None => error,
                });
            }
        }

        tracing::info!(
            "Consul ACL system bootstrapped, tokens saved to {}",
            self.store.path().display()
        );

        Ok(BootstrapOutcome::Bootstrapped)
    }

    async fn reconcile(self, bootstrap_token: &str) -> Result<BootstrapOutcome, BootstrapError> {
        tracing::info!("Consul ACLs already bootstrapped, updating the cluster policy");

        self.consul.authenticate(bootstrap_token);

        let policy = ConsulPolicy::Agent;
        self.consul
            .update_policy(policy.name(), &self.policies.path(policy))
            .await
            .map_err(BootstrapError::Reconcile)?;

        Ok(BootstrapOutcome::Reconciled)
    }
}

/// Where a cluster's artifacts live and what its nodes are called.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub inventory_path: PathBuf,
    pub base_dir: PathBuf,
    pub dc_name: String,
    pub network_interface: String,
}

impl From<&Config> for Cluster {
    fn from(config: &Config) -> Self {
        Self {
            inventory_path: config.inventory_path(),
            base_dir: config.base_dir.clone(),
            dc_name: config.dc_name.clone(),
            network_interface: config.cloud_provider_config.network_interface.clone(),
        }
    }
}

/// Everything produced locally before talking to the cluster.
pub struct Configured {
    pub inventory: Inventory,
    pub store: SecretsStore,
    pub record: SecretsRecord,
    pub policies: RenderedPolicies,
    pub consul_certificates: ConsulCertificates,
}

/// Renders the policies and node configs for the current inventory and makes sure the
/// secrets and certificates exist. Existing secrets and certificates are never replaced.
pub fn configure(
    cluster: &Cluster,
    credentials: Option<ObjectStorageCredentials>,
) -> Result<Configured, BootstrapError> {
    let inventory = Inventory::read(&cluster.inventory_path)?;

    let policies =
        PolicyRenderer::new(PolicyTemplates::default(), &cluster.base_dir).render(&inventory)?;

    NodeConfigRenderer::new(
        NodeConfigTemplates::default(),
        &cluster.base_dir,
        &cluster.dc_name,
        &cluster.network_interface,
    )
    .render(&inventory)?;

    let store = SecretsStore::new(&cluster.base_dir);
    let record = ensure_secrets(&store, credentials)?;

    let consul_certificates = ensure_consul_certificates(&cluster.base_dir, &cluster.dc_name)?;
    ensure_nomad_certificates(&cluster.base_dir)?;

    Ok(Configured {
        inventory,
        store,
        record,
        policies,
        consul_certificates,
    })
}

/// Bootstraps or reconciles the live cluster from the artifacts of [`configure`].
pub async fn bootstrap_configured(
    configured: &Configured,
) -> Result<BootstrapOutcome, BootstrapError> {
    let mut consul = ConsulHttpClient::new(&configured.inventory, &configured.consul_certificates)
        .map_err(BootstrapError::Connect)?;

    // configure has already created the secrets file
    Orchestrator::new(&mut consul, &configured.store, &configured.policies)
        .run(None)
        .await
}

/// Configures the cluster artifacts, then bootstraps or reconciles the live cluster.
pub async fn bootstrap(
    cluster: &Cluster,
    credentials: Option<ObjectStorageCredentials>,
) -> Result<BootstrapOutcome, BootstrapError> {
    let configured = configure(cluster, credentials)?;

    bootstrap_configured(&configured).await
}
