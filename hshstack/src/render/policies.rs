use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use minijinja::context;
use strum::{EnumIter, IntoEnumIterator};

use super::{render_template, write_file, RenderError};
use crate::inventory::Inventory;

/// The fixed set of ACL policies of a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter)]
pub enum ConsulPolicy {
    /// Node identity of every agent in the cluster
    Agent,
    NomadClient,
    NomadServer,
    /// Read access for prometheus scraping
    Prometheus,
    /// Attached to the anonymous token to allow discovery without a token
    Anonymous,
}

impl ConsulPolicy {
    /// Name of the policy in Consul, used both for creating and updating it.
    pub fn name(&self) -> &'static str {
        match self {
            ConsulPolicy::Agent => "consul-policies",
            ConsulPolicy::NomadClient => "nomad-client",
            ConsulPolicy::NomadServer => "nomad-server",
            ConsulPolicy::Prometheus => "prometheus",
            ConsulPolicy::Anonymous => "anonymous",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ConsulPolicy::Agent => "consul-policies.hcl",
            ConsulPolicy::NomadClient => "nomad-client-policy.hcl",
            ConsulPolicy::NomadServer => "nomad-server-policy.hcl",
            ConsulPolicy::Prometheus => "prometheus-policy.hcl",
            ConsulPolicy::Anonymous => "anonymous-policy.hcl",
        }
    }
}

impl Display for ConsulPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Template source of each policy. `hosts` holds the distinct host names of the inventory.
#[derive(Clone, Debug)]
pub struct PolicyTemplates {
    pub agent: String,
    pub nomad_client: String,
    pub nomad_server: String,
    pub prometheus: String,
    pub anonymous: String,
}

impl Default for PolicyTemplates {
    fn default() -> Self {
        Self {
            agent: include_str!("../../templates/policies/consul-policies.hcl").to_string(),
            nomad_client: include_str!("../../templates/policies/nomad-client-policy.hcl")
                .to_string(),
            nomad_server: include_str!("../../templates/policies/nomad-server-policy.hcl")
                .to_string(),
            prometheus: include_str!("../../templates/policies/prometheus-policy.hcl").to_string(),
            anonymous: include_str!("../../templates/policies/anonymous-policy.hcl").to_string(),
        }
    }
}

impl PolicyTemplates {
    fn template(&self, policy: ConsulPolicy) -> &str {
        match policy {
            ConsulPolicy::Agent => &self.agent,
            ConsulPolicy::NomadClient => &self.nomad_client,
            ConsulPolicy::NomadServer => &self.nomad_server,
            ConsulPolicy::Prometheus => &self.prometheus,
            ConsulPolicy::Anonymous => &self.anonymous,
        }
    }
}

/// The policy files written by [`PolicyRenderer::render`].
#[derive(Clone, Debug)]
pub struct RenderedPolicies {
    dir: PathBuf,
}

impl RenderedPolicies {
    pub fn path(&self, policy: ConsulPolicy) -> PathBuf {
        self.dir.join(policy.file_name())
    }
}

pub struct PolicyRenderer {
    templates: PolicyTemplates,
    output_dir: PathBuf,
}

impl PolicyRenderer {
    pub fn new(templates: PolicyTemplates, base_dir: impl AsRef<Path>) -> Self {
        Self {
            templates,
            output_dir: base_dir.as_ref().join("consul"),
        }
    }

    pub fn render(&self, inventory: &Inventory) -> Result<RenderedPolicies, RenderError> {
        let hosts = inventory.host_names()?;

        for policy in ConsulPolicy::iter() {
            let contents = render_template(
                policy.file_name(),
                self.templates.template(policy),
                context! { hosts => &hosts },
            )?;

            write_file(self.output_dir.join(policy.file_name()), &contents)?;
        }

        Ok(RenderedPolicies {
            dir: self.output_dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::tempdir;

    fn node_entries(policy: &str) -> Vec<&str> {
        policy
            .lines()
            .filter(|line| line.starts_with("node \""))
            .collect()
    }

    #[test]
    fn cluster_policy_has_one_node_entry_per_host() {
        let dir = tempdir().unwrap();
        let inventory = Inventory::parse(
            "[consul_servers]
10.0.0.1 host_name=server-1 private_ip=10.1.0.1
10.0.0.2 host_name=server-2 private_ip=10.1.0.2
10.0.0.3 host_name=server-3 private_ip=10.1.0.3
[nomad_servers]
10.0.0.1 host_name=server-1 private_ip=10.1.0.1
",
        )
        .unwrap();

        let renderer = PolicyRenderer::new(PolicyTemplates::default(), dir.path());
        let rendered = renderer.render(&inventory).unwrap();

        let policy = fs::read_to_string(rendered.path(ConsulPolicy::Agent)).unwrap();
        assert_eq!(
            node_entries(&policy),
            vec![
                "node \"server-1\" {",
                "node \"server-2\" {",
                "node \"server-3\" {"
            ]
        );

        for policy in ConsulPolicy::iter() {
            assert!(rendered.path(policy).exists(), "{policy} was not written");
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let dir = tempdir().unwrap();
        let inventory =
            Inventory::parse("[clients]\n10.0.0.1 host_name=client-1 private_ip=10.1.0.1\n")
                .unwrap();
        let renderer = PolicyRenderer::new(PolicyTemplates::default(), dir.path());

        let rendered = renderer.render(&inventory).unwrap();
        let first = fs::read_to_string(rendered.path(ConsulPolicy::Agent)).unwrap();

        renderer.render(&inventory).unwrap();
        let second = fs::read_to_string(rendered.path(ConsulPolicy::Agent)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn templates_are_passed_in() {
        let dir = tempdir().unwrap();
        let inventory =
            Inventory::parse("[clients]\n10.0.0.1 host_name=client-1 private_ip=10.1.0.1\n")
                .unwrap();
        let templates = PolicyTemplates {
            agent: "{{ hosts | join(',') }}".to_string(),
            ..PolicyTemplates::default()
        };

        let rendered = PolicyRenderer::new(templates, dir.path())
            .render(&inventory)
            .unwrap();

        assert_eq!(
            fs::read_to_string(rendered.path(ConsulPolicy::Agent)).unwrap(),
            "client-1"
        );
    }

    #[test]
    fn unknown_template_variables_fail() {
        let dir = tempdir().unwrap();
        let templates = PolicyTemplates {
            anonymous: "{{ missing }}".to_string(),
            ..PolicyTemplates::default()
        };

        let result = PolicyRenderer::new(templates, dir.path()).render(&Inventory::default());

        assert!(matches!(result, Err(RenderError::Template { .. })));
    }
}
