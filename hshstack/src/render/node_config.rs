use std::path::{Path, PathBuf};

use minijinja::context;

use super::{render_template, write_file, RenderError};
use crate::inventory::{Inventory, InventoryError, CONSUL_SERVERS, NOMAD_SERVERS};

/// Template sources of the files the setup playbook distributes to the nodes.
///
/// The `.j2` outputs are templates again: they are finished by ansible, which fills in
/// host facts and the secrets.
#[derive(Clone, Debug)]
pub struct NodeConfigTemplates {
    pub consul_server: String,
    pub consul_client: String,
    pub consul_service: String,
    pub nomad_server: String,
    pub nomad_client: String,
    pub nomad_service: String,
    pub setup_playbook: String,
    pub destroy_playbook: String,
}

impl Default for NodeConfigTemplates {
    fn default() -> Self {
        Self {
            consul_server: include_str!("../../templates/consul/server.hcl.j2").to_string(),
            consul_client: include_str!("../../templates/consul/client.hcl.j2").to_string(),
            consul_service: include_str!("../../templates/consul/consul.service").to_string(),
            nomad_server: include_str!("../../templates/nomad/server.hcl.j2").to_string(),
            nomad_client: include_str!("../../templates/nomad/client.hcl.j2").to_string(),
            nomad_service: include_str!("../../templates/nomad/nomad.service").to_string(),
            setup_playbook: include_str!("../../templates/ansible/setup.yml").to_string(),
            destroy_playbook: include_str!("../../templates/ansible/destroy.yml").to_string(),
        }
    }
}

pub struct NodeConfigRenderer {
    templates: NodeConfigTemplates,
    base_dir: PathBuf,
    dc_name: String,
    network_interface: String,
}

impl NodeConfigRenderer {
    pub fn new(
        templates: NodeConfigTemplates,
        base_dir: impl AsRef<Path>,
        dc_name: impl Into<String>,
        network_interface: impl Into<String>,
    ) -> Self {
        Self {
            templates,
            base_dir: base_dir.as_ref().to_owned(),
            dc_name: dc_name.into(),
            network_interface: network_interface.into(),
        }
    }

    pub fn setup_playbook(&self) -> PathBuf {
        self.base_dir.join("setup.yml")
    }

    pub fn destroy_playbook(&self) -> PathBuf {
        self.base_dir.join("destroy.yml")
    }

    pub fn render(&self, inventory: &Inventory) -> Result<(), RenderError> {
        let consul_servers = inventory.private_ips(CONSUL_SERVERS)?;
        if consul_servers.is_empty() {
            return Err(InventoryError::MissingGroup(CONSUL_SERVERS.to_string()).into());
        }

        let nomad_servers = inventory.private_ips(NOMAD_SERVERS)?;
        if nomad_servers.is_empty() {
            return Err(InventoryError::MissingGroup(NOMAD_SERVERS.to_string()).into());
        }

        let consul = context! {
            dc => &self.dc_name,
            retry_join => &consul_servers,
            bootstrap_expect => consul_servers.len(),
        };

        let nomad = context! {
            dc => &self.dc_name,
            nomad_servers => &nomad_servers,
            bootstrap_expect => nomad_servers.len(),
            network_interface => &self.network_interface,
        };

        let playbooks = context! { dc => &self.dc_name };

        let t = &self.templates;
        let files = [
            ("consul/server.hcl.j2", &t.consul_server, &consul),
            ("consul/client.hcl.j2", &t.consul_client, &consul),
            ("consul/consul.service", &t.consul_service, &consul),
            ("nomad/server.hcl.j2", &t.nomad_server, &nomad),
            ("nomad/client.hcl.j2", &t.nomad_client, &nomad),
            ("nomad/nomad.service", &t.nomad_service, &nomad),
            ("setup.yml", &t.setup_playbook, &playbooks),
            ("destroy.yml", &t.destroy_playbook, &playbooks),
        ];

        for (file, template, context) in files {
            let contents = render_template(file, template, context)?;
            write_file(self.base_dir.join(file), &contents)?;
        }

        Ok(())
    }
}
