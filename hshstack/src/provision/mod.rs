//! Drives a whole cluster lifecycle: infrastructure with terraform, node configuration with
//! ansible and, once Consul is up, the ACL bootstrap.

pub mod ansible;
mod external_dependencies;
mod subprocess;
mod terraform;

use std::{
    fs,
    io::{self, BufRead},
    time::Duration,
};

use anyhow::Context;
use common::{
    clap::{CliSecret, PlainRedactor},
    tracing::log_step_result,
};

pub use external_dependencies::check_dependencies;
pub use terraform::{Terraform, TerraformRenderer, TerraformTemplates};

use crate::{
    bootstrap::{bootstrap_configured, configure, Cluster},
    config::Config,
    inventory::generate_inventory,
    observability::observability,
    render::{NodeConfigRenderer, NodeConfigTemplates},
    secrets::{ObjectStorageCredentials, SecretsStore},
};

/// Time for sshd to come up on freshly created servers.
const SSH_STARTUP_WAIT: Duration = Duration::from_secs(10);

const TERRAFORM_OUTPUT_FILE: &str = "output.json";

#[derive(Clone, Copy, PartialEq)]
pub enum AssumeYes {
    AlwaysAsk,
    DefaultYes,
}

impl AssumeYes {
    pub fn from_boolean(assume_yes: bool) -> Self {
        if assume_yes {
            AssumeYes::DefaultYes
        } else {
            AssumeYes::AlwaysAsk
        }
    }
}

/// Prompts the user to type in a confirmation word in order to proceed.
///
/// Any other answer, or no answer at all, cancels.
fn ask_user_to_confirm(
    message: &str,
    assume_yes: AssumeYes,
    mut input: impl BufRead,
) -> anyhow::Result<bool> {
    if assume_yes == AssumeYes::DefaultYes {
        return Ok(true);
    }

    const CONFIRMATION_WORD: &str = "yes";

    println!("{message}\nType '{CONFIRMATION_WORD}' to confirm.");
    let mut answer = String::new();
    if input.read_line(&mut answer)? == 0 {
        return Ok(false);
    }

    Ok(answer.trim().to_lowercase() == CONFIRMATION_WORD)
}

fn node_config_renderer(config: &Config) -> NodeConfigRenderer {
    NodeConfigRenderer::new(
        NodeConfigTemplates::default(),
        &config.base_dir,
        &config.dc_name,
        &config.cloud_provider_config.network_interface,
    )
}

async fn run_setup_playbook(config: &Config) -> anyhow::Result<()> {
    let playbook = node_config_renderer(config).setup_playbook();
    let secrets = SecretsStore::new(&config.base_dir);

    let result = ansible::run_playbook(
        &playbook,
        &config.inventory_path(),
        &config.cloud_provider_config.user,
        &[secrets.path()],
    )
    .await;
    log_step_result("Setup playbook", &result);

    result
}

/// Creates or updates the infrastructure and brings the cluster to the desired state.
///
/// Safe to run repeatedly: secrets and certificates are created once and an already
/// bootstrapped cluster only has its cluster policy updated.
pub async fn sync(
    config: &Config,
    hcloud_token: CliSecret<String, PlainRedactor>,
    credentials: Option<ObjectStorageCredentials>,
) -> anyhow::Result<()> {
    let terraform_dir = config.terraform_dir();

    TerraformRenderer::new(TerraformTemplates::default(), &terraform_dir).render(
        &config.cluster_config,
        &config.observability_config,
        &config.hetzner_settings()?,
    )?;

    let terraform = Terraform::new(&terraform_dir, hcloud_token);
    terraform.init().await?;

    let result = terraform.apply().await;
    log_step_result("Terraform apply", &result);
    result?;

    let output = terraform.output_json().await?;
    let output_path = terraform_dir.join(TERRAFORM_OUTPUT_FILE);
    fs::write(&output_path, &output)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;

    let inventory = generate_inventory(&output)?;
    let inventory_path = config.inventory_path();
    fs::write(&inventory_path, inventory)
        .with_context(|| format!("Failed to write {}", inventory_path.display()))?;
    tracing::info!("Inventory written to {}", inventory_path.display());

    let configured = configure(&Cluster::from(config), credentials)?;

    tracing::info!("Waiting {SSH_STARTUP_WAIT:?} for the servers to accept ssh connections");
    tokio::time::sleep(SSH_STARTUP_WAIT).await;

    run_setup_playbook(config).await?;

    let result = bootstrap_configured(&configured).await;
    log_step_result("Bootstrap", &result);
    let outcome = result?;

    // The nodes were configured before their tokens existed
    if outcome.has_bootstrapped() {
        run_setup_playbook(config).await?;
    }

    let result = observability(config).await;
    log_step_result("Observability", &result);
    result
}

/// Tears down the services on the nodes, then the infrastructure itself.
pub async fn destroy(
    config: &Config,
    hcloud_token: CliSecret<String, PlainRedactor>,
    assume_yes: AssumeYes,
) -> anyhow::Result<()> {
    let confirmed = ask_user_to_confirm(
        &format!(
            "You're about to destroy the '{}' cluster and every server in it.",
            config.dc_name
        ),
        assume_yes,
        io::stdin().lock(),
    )?;
    if !confirmed {
        println!("Delete cancelled");
        return Ok(());
    }

    let playbook = node_config_renderer(config).destroy_playbook();
    let inventory_path = config.inventory_path();

    if playbook.exists() && inventory_path.exists() {
        let result = ansible::run_playbook(
            &playbook,
            &inventory_path,
            &config.cloud_provider_config.user,
            &[],
        )
        .await;
        log_step_result("Destroy playbook", &result);
        result?;
    } else {
        tracing::warn!("No inventory or destroy playbook found, skipping node teardown");
    }

    let result = Terraform::new(config.terraform_dir(), hcloud_token)
        .destroy()
        .await;
    log_step_result("Terraform destroy", &result);

    result
}
