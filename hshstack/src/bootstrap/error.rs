use std::path::PathBuf;

use thiserror::Error;

use super::BootstrapStep;
use crate::{
    consul::ConsulError, inventory::InventoryError, render::RenderError, secrets::pki::PkiError,
    secrets::SecretsError,
};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Invalid inventory: {0}")]
    Configuration(#[from] InventoryError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Secrets(#[from] SecretsError),
    #[error(transparent)]
    Pki(#[from] PkiError),
    #[error("Failed to set up the consul client: {0}")]
    Connect(#[source] ConsulError),
    #[error("Step '{step}' failed: {source}")]
    Remote {
        step: BootstrapStep,
        #[source]
        source: ConsulError,
    },
    #[error("Failed to update the cluster policy: {0}")]
    Reconcile(#[source] ConsulError),
    #[error(
        "Consul ACLs are already bootstrapped but {secrets_path} holds no bootstrap token. \
         Restore the secrets file or reset the ACL system before retrying"
    )]
    AlreadyBootstrappedInconsistency { secrets_path: PathBuf },
    #[error(
        "Step '{step}' failed after the ACL system was bootstrapped, nothing has been saved. \
         The bootstrap token is {bootstrap_token}, keep it to recover the cluster: {source}"
    )]
    PartiallyBootstrapped {
        step: BootstrapStep,
        bootstrap_token: String,
        #[source]
        source: Box<BootstrapError>,
    },
}
