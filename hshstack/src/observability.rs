//! Registers the monitoring stack (prometheus, grafana, loki, tempo) with the service
//! mesh and installs it. This talks to Consul with the bootstrap token, so it only works
//! on a cluster that has been bootstrapped.

use std::path::{Path, PathBuf};

use anyhow::Context;
use itertools::Itertools;
use minijinja::context;
use thiserror::Error;

use crate::{
    config::{Config, ObservabilityConfig},
    consul::{Consul, ConsulError, ConsulHttpClient},
    inventory::{Inventory, CLIENTS, CONSUL_SERVERS, GRAFANA, LOKI, NOMAD_SERVERS, PROMETHEUS, TEMPO},
    provision::ansible::run_playbook,
    render::{render_template, write_file, RenderError},
    secrets::{pki::ConsulCertificates, AclToken, SecretsRecord, SecretsStore},
};

#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("The cluster has not been bootstrapped, run sync or bootstrap first")]
    NotBootstrapped,
    #[error("No {0} bucket configured in observability_config")]
    MissingBucket(&'static str),
    #[error("The secrets file holds no object storage endpoint for loki and tempo")]
    MissingObjectStorage,
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("Failed to register {name} with consul: {source}")]
    Registration {
        name: String,
        #[source]
        source: ConsulError,
    },
}

/// A service of the monitoring stack, reachable at the first host of its inventory group.
#[derive(Clone, Copy, Debug)]
pub struct ObservabilityService {
    pub name: &'static str,
    pub port: u16,
    pub group: &'static str,
}

impl ObservabilityService {
    const fn new(name: &'static str, port: u16, group: &'static str) -> Self {
        Self { name, port, group }
    }
}

pub const SERVICES: [ObservabilityService; 5] = [
    ObservabilityService::new("tempo-grpc", 4317, TEMPO),
    ObservabilityService::new("tempo", 3200, TEMPO),
    ObservabilityService::new("prometheus", 9090, PROMETHEUS),
    ObservabilityService::new("loki", 3100, LOKI),
    ObservabilityService::new("grafana", 3000, GRAFANA),
];

#[derive(Clone, Debug)]
pub struct ObservabilityTemplates {
    pub prometheus: String,
    /// Loki and tempo read their storage credentials from the secrets file at install time
    pub loki: String,
    pub tempo: String,
    pub service: String,
    pub intention: String,
    pub playbook: String,
}

impl Default for ObservabilityTemplates {
    fn default() -> Self {
        Self {
            prometheus: include_str!("../templates/observability/prometheus.yml").to_string(),
            loki: include_str!("../templates/observability/loki-config.yml").to_string(),
            tempo: include_str!("../templates/observability/tempo.yml").to_string(),
            service: include_str!("../templates/observability/service.json").to_string(),
            intention: include_str!("../templates/observability/intention.json").to_string(),
            playbook: include_str!("../templates/ansible/observability.yml").to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenderedObservability {
    pub playbook: PathBuf,
    pub prometheus_config: PathBuf,
    pub loki_config: PathBuf,
    pub tempo_config: PathBuf,
    /// Service definition and intention of each service, in registration order
    pub services: Vec<(PathBuf, PathBuf)>,
}

pub struct ObservabilityRenderer {
    templates: ObservabilityTemplates,
    base_dir: PathBuf,
}

impl ObservabilityRenderer {
    pub fn new(templates: ObservabilityTemplates, base_dir: impl AsRef<Path>) -> Self {
        Self {
            templates,
            base_dir: base_dir.as_ref().to_owned(),
        }
    }

    pub fn render(
        &self,
        inventory: &Inventory,
        config: &ObservabilityConfig,
    ) -> Result<RenderedObservability, ObservabilityError> {
        if config.loki_bucket.is_empty() {
            return Err(ObservabilityError::MissingBucket("loki"));
        }
        if config.tempo_bucket.is_empty() {
            return Err(ObservabilityError::MissingBucket("tempo"));
        }

        let clients = inventory.private_ips(CLIENTS).map_err(RenderError::from)?;
        let consul_hosts: Vec<&str> = clients
            .iter()
            .copied()
            .chain(inventory.private_ips(CONSUL_SERVERS).map_err(RenderError::from)?)
            .unique()
            .collect();
        let nomad_hosts: Vec<&str> = clients
            .iter()
            .copied()
            .chain(inventory.private_ips(NOMAD_SERVERS).map_err(RenderError::from)?)
            .unique()
            .collect();

        let prometheus = render_template(
            "prometheus.yml",
            &self.templates.prometheus,
            context! {
                consul_hosts => consul_hosts,
                nomad_hosts => nomad_hosts,
            },
        )?;
        let prometheus_config = self.base_dir.join("prometheus").join("prometheus.yml");
        write_file(&prometheus_config, &prometheus)?;

        let loki = render_template(
            "loki-config.yml",
            &self.templates.loki,
            context! { bucket => &config.loki_bucket },
        )?;
        let loki_config = self.base_dir.join("loki").join("loki-config.yml");
        write_file(&loki_config, &loki)?;

        let tempo = render_template(
            "tempo.yml",
            &self.templates.tempo,
            context! { bucket => &config.tempo_bucket },
        )?;
        let tempo_config = self.base_dir.join("tempo").join("tempo.yml");
        write_file(&tempo_config, &tempo)?;

        let dir = self.base_dir.join("observability");
        let mut services = Vec::with_capacity(SERVICES.len());

        for service in SERVICES {
            let address = inventory.first_private_ip(service.group).map_err(RenderError::from)?;

            let definition = render_template(
                "service.json",
                &self.templates.service,
                context! {
                    name => service.name,
                    address => address,
                    port => service.port,
                },
            )?;
            let intention = render_template(
                "intention.json",
                &self.templates.intention,
                context! { name => service.name },
            )?;

            let definition_path = dir.join("services").join(format!("{}.json", service.name));
            let intention_path = dir.join("intentions").join(format!("{}.json", service.name));
            write_file(&definition_path, &definition)?;
            write_file(&intention_path, &intention)?;

            services.push((definition_path, intention_path));
        }

        let playbook = self.base_dir.join("observability.yml");
        write_file(&playbook, &self.templates.playbook)?;

        Ok(RenderedObservability {
            playbook,
            prometheus_config,
            loki_config,
            tempo_config,
            services,
        })
    }
}

/// Registers every rendered service and its intention using the bootstrap token.
pub async fn register_services<C: Consul>(
    consul: &mut C,
    record: &SecretsRecord,
    rendered: &RenderedObservability,
) -> Result<(), ObservabilityError> {
    let bootstrap_token = record
        .token(AclToken::Bootstrap)
        .ok_or(ObservabilityError::NotBootstrapped)?;
    consul.authenticate(bootstrap_token);

    for (service, (definition, intention)) in SERVICES.iter().zip(&rendered.services) {
        let registration_error = |source| ObservabilityError::Registration {
            name: service.name.to_string(),
            source,
        };

        tracing::info!("Registering {} with consul", service.name);
        consul
            .register_service(definition)
            .await
            .map_err(registration_error)?;
        consul
            .register_intention(intention)
            .await
            .map_err(registration_error)?;
    }

    Ok(())
}

/// Registers the monitoring services with the cluster, then installs them.
pub async fn observability(config: &Config) -> anyhow::Result<()> {
    let store = SecretsStore::new(&config.base_dir);
    let record = store
        .load()?
        .ok_or(ObservabilityError::NotBootstrapped)?;
    if !record.is_issued(AclToken::Bootstrap) {
        return Err(ObservabilityError::NotBootstrapped.into());
    }
    if record.object_storage().endpoint.is_empty() {
        return Err(ObservabilityError::MissingObjectStorage.into());
    }

    let inventory = Inventory::read(config.inventory_path())?;
    let rendered =
        ObservabilityRenderer::new(ObservabilityTemplates::default(), &config.base_dir)
            .render(&inventory, &config.observability_config)?;

    let certificates = ConsulCertificates::new(&config.base_dir, &config.dc_name);
    let mut consul = ConsulHttpClient::new(&inventory, &certificates)?;
    register_services(&mut consul, &record, &rendered).await?;

    run_playbook(
        &rendered.playbook,
        &config.inventory_path(),
        &config.cloud_provider_config.user,
        &[store.path()],
    )
    .await
    .context("Failed to install the observability stack")
}
