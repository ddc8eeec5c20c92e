//! Reader for the Ansible style host inventory that describes the cluster.
//!
//! The document is a list of `[group]` headers, each followed by host lines of the form
//! `address key1=value1 key2=value2`. `[group:vars]` and `[group:children]` sections are
//! understood as well so hand written inventories keep working.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::Deserialize;
use thiserror::Error;

/// Group that hosts listed before the first header belong to.
pub const UNGROUPED: &str = "ungrouped";

pub const CONSUL_SERVERS: &str = "consul_servers";
pub const NOMAD_SERVERS: &str = "nomad_servers";
pub const VAULT_SERVERS: &str = "vault_servers";
pub const CLIENTS: &str = "clients";
pub const GRAFANA: &str = "grafana";
pub const PROMETHEUS: &str = "prometheus";
pub const LOKI: &str = "loki";
pub const TEMPO: &str = "tempo";

const HOST_NAME: &str = "host_name";
const PRIVATE_IP: &str = "private_ip";

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Line {line}: malformed group header '{header}'")]
    MalformedHeader { line: usize, header: String },
    #[error("Line {line}: expected 'key=value', found '{token}'")]
    MalformedAttribute { line: usize, token: String },
    #[error("Line {line}: unterminated quote")]
    UnterminatedQuote { line: usize },
    #[error("Group '{parent}' lists unknown child group '{child}'")]
    UnknownChildGroup { parent: String, child: String },
    #[error("Host '{address}' has no '{attribute}' attribute")]
    MissingAttribute { address: String, attribute: String },
    #[error("Inventory has no hosts in the '{0}' group")]
    MissingGroup(String),
    #[error("Unexpected terraform output: {0}")]
    TerraformOutput(String),
    #[error("Failed to parse terraform output: {0}")]
    TerraformOutputJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    address: String,
    attributes: BTreeMap<String, String>,
}

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The public address or hostname, which is also the identity of the host.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn host_name(&self) -> Result<&str, InventoryError> {
        self.required_attribute(HOST_NAME)
    }

    pub fn private_ip(&self) -> Result<&str, InventoryError> {
        self.required_attribute(PRIVATE_IP)
    }

    fn required_attribute(&self, key: &str) -> Result<&str, InventoryError> {
        self.attribute(key)
            .ok_or_else(|| InventoryError::MissingAttribute {
                address: self.address.clone(),
                attribute: key.to_string(),
            })
    }

    fn merge(&mut self, other: Host) {
        self.attributes.extend(other.attributes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    name: String,
    hosts: Vec<Host>,
}

impl Group {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Adds a host, merging attributes into an existing entry with the same address.
    fn add_host(&mut self, host: Host) {
        match self.hosts.iter_mut().find(|h| h.address == host.address) {
            Some(existing) => existing.merge(host),
            None => self.hosts.push(host),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    groups: Vec<Group>,
}

enum Section {
    Hosts(usize),
    Vars(String),
    Children(String),
}

impl Inventory {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_owned(),
            source,
        })?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, InventoryError> {
        let mut inventory = Inventory::default();
        let mut section: Option<Section> = None;

        let mut group_vars: Vec<(String, String, String)> = Vec::new();
        let mut children: Vec<(String, String)> = Vec::new();

        for (index, raw_line) in contents.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                section = Some(inventory.parse_header(line, line_number)?);
                continue;
            }

            match &section {
                None => {
                    let host = parse_host_line(line, line_number)?;
                    let index = inventory.group_index_or_insert(UNGROUPED);
                    inventory.groups[index].add_host(host);
                }
                Some(Section::Hosts(index)) => {
                    let host = parse_host_line(line, line_number)?;
                    inventory.groups[*index].add_host(host);
                }
                Some(Section::Vars(group)) => {
                    let (key, value) = parse_assignment(line, line_number)?;
                    group_vars.push((group.clone(), key, value));
                }
                Some(Section::Children(parent)) => {
                    children.push((parent.clone(), line.to_string()));
                }
            }
        }

        for (parent, child) in children {
            let Some(child_hosts) = inventory.group(&child).map(|g| g.hosts.clone()) else {
                return Err(InventoryError::UnknownChildGroup { parent, child });
            };

            let index = inventory.group_index_or_insert(&parent);
            for host in child_hosts {
                inventory.groups[index].add_host(host);
            }
        }

        // Host level attributes take precedence over group vars
        for (group, key, value) in group_vars {
            if let Some(index) = inventory.group_index(&group) {
                for host in inventory.groups[index].hosts.iter_mut() {
                    host.attributes
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }

        Ok(inventory)
    }

    fn parse_header(&mut self, line: &str, line_number: usize) -> Result<Section, InventoryError> {
        let malformed = || InventoryError::MalformedHeader {
            line: line_number,
            header: line.to_string(),
        };

        let inner = line
            .strip_prefix('[')
            .and_then(|l| l.strip_suffix(']'))
            .map(str::trim)
            .ok_or_else(malformed)?;

        let (name, kind) = match inner.split_once(':') {
            Some((name, kind)) => (name.trim(), Some(kind.trim())),
            None => (inner, None),
        };

        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(malformed());
        }

        match kind {
            None => Ok(Section::Hosts(self.group_index_or_insert(name))),
            Some("vars") => Ok(Section::Vars(name.to_string())),
            Some("children") => {
                self.group_index_or_insert(name);
                Ok(Section::Children(name.to_string()))
            }
            Some(_) => Err(malformed()),
        }
    }

    fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    fn group_index_or_insert(&mut self, name: &str) -> usize {
        match self.group_index(name) {
            Some(index) => index,
            None => {
                self.groups.push(Group::new(name));
                self.groups.len() - 1
            }
        }
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Addresses of the hosts in a group. Missing groups have no hosts.
    pub fn hosts(&self, group: &str) -> Vec<&str> {
        self.group(group)
            .map(|g| g.hosts.iter().map(Host::address).collect())
            .unwrap_or_default()
    }

    pub fn first_host(&self, group: &str) -> Option<&Host> {
        self.group(group).and_then(|g| g.hosts.first())
    }

    pub fn private_ips(&self, group: &str) -> Result<Vec<&str>, InventoryError> {
        self.group(group)
            .map(|g| g.hosts.iter().map(Host::private_ip).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// First private IP of a group that must not be empty.
    pub fn first_private_ip(&self, group: &str) -> Result<&str, InventoryError> {
        self.first_host(group)
            .ok_or_else(|| InventoryError::MissingGroup(group.to_string()))?
            .private_ip()
    }

    /// Distinct host names across every group, in document order.
    pub fn host_names(&self) -> Result<Vec<&str>, InventoryError> {
        let names = self
            .groups
            .iter()
            .flat_map(|g| g.hosts.iter())
            .map(Host::host_name)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(names.into_iter().unique().collect())
    }
}

fn parse_host_line(line: &str, line_number: usize) -> Result<Host, InventoryError> {
    let mut tokens = split_tokens(line, line_number)?.into_iter();

    // A non-empty line always has at least one token, unless it was only a trailing comment
    let Some(address) = tokens.next() else {
        return Err(InventoryError::MalformedAttribute {
            line: line_number,
            token: line.to_string(),
        });
    };

    let mut host = Host::new(address);
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            return Err(InventoryError::MalformedAttribute {
                line: line_number,
                token,
            });
        };
        host.attributes.insert(key.to_string(), value.to_string());
    }

    Ok(host)
}

fn parse_assignment(line: &str, line_number: usize) -> Result<(String, String), InventoryError> {
    let Some((key, value)) = line.split_once('=') else {
        return Err(InventoryError::MalformedAttribute {
            line: line_number,
            token: line.to_string(),
        });
    };

    let value = split_tokens(value.trim(), line_number)?.join(" ");
    Ok((key.trim().to_string(), value))
}

/// Splits a line on whitespace, honouring single and double quotes and dropping
/// a trailing `#` comment.
fn split_tokens(line: &str, line_number: usize) -> Result<Vec<String>, InventoryError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '#' && !in_token => break,
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(InventoryError::UnterminatedQuote { line: line_number });
    }

    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

#[derive(Deserialize)]
struct TerraformOutputValue {
    value: Vec<String>,
}

/// Builds an inventory document from `terraform output -json`.
///
/// Each output value is a list of ready made host lines. When no dedicated consul servers
/// exist the nomad servers double as consul servers. A single observability server hosts
/// grafana, prometheus, loki and tempo; otherwise there must be one server for each.
pub fn generate_inventory(terraform_output: &str) -> Result<String, InventoryError> {
    let outputs: HashMap<String, TerraformOutputValue> = serde_json::from_str(terraform_output)?;

    let output = |name: &str| -> Vec<String> {
        outputs
            .get(name)
            .map(|o| o.value.clone())
            .unwrap_or_default()
    };

    let nomad_servers = output("nomad_servers");
    let mut consul_servers = output("consul_servers");
    if consul_servers.is_empty() {
        consul_servers = nomad_servers.clone();
    }

    let observability_servers = output("o11y_servers");
    let observability_groups = [GRAFANA, PROMETHEUS, LOKI, TEMPO];
    let observability: Vec<(&str, Vec<String>)> = match observability_servers.len() {
        0 => Vec::new(),
        1 => observability_groups
            .iter()
            .map(|group| (*group, observability_servers.clone()))
            .collect(),
        n if n == observability_groups.len() => observability_groups
            .iter()
            .zip(observability_servers.iter())
            .map(|(group, host)| (*group, vec![host.clone()]))
            .collect(),
        n => {
            return Err(InventoryError::TerraformOutput(format!(
                "expected 1 or {} observability servers, found {n}",
                observability_groups.len()
            )))
        }
    };

    let sections = [
        (CONSUL_SERVERS, consul_servers),
        (VAULT_SERVERS, output("vault_servers")),
        (NOMAD_SERVERS, nomad_servers),
        (CLIENTS, output("client_servers")),
    ]
    .into_iter()
    .chain(observability);

    let mut document = String::new();
    for (name, hosts) in sections {
        if hosts.is_empty() {
            continue;
        }

        document.push_str(&format!("[{name}]\n"));
        for host in hosts {
            document.push_str(host.trim());
            document.push('\n');
        }
    }

    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
# generated by terraform
[consul_servers]
116.203.48.99 host_name=nomad-srv-nomad-server-1 private_ip=10.0.1.2
195.201.124.132 host_name=nomad-srv-nomad-server-2 private_ip=10.0.1.3
116.203.21.77 host_name=nomad-srv-nomad-server-3 private_ip=10.0.1.4
[nomad_servers]
116.203.48.99 host_name=nomad-srv-nomad-server-1 private_ip=10.0.1.2
195.201.124.132 host_name=nomad-srv-nomad-server-2 private_ip=10.0.1.3
116.203.21.77 host_name=nomad-srv-nomad-server-3 private_ip=10.0.1.4
[clients]
159.69.147.86 host_name=nomad-srv-client-1 private_ip=10.0.3.2
195.201.127.116 host_name=nomad-srv-client-2 private_ip=10.0.3.3
"#;

    #[test]
    fn parses_groups_in_document_order() {
        let inventory = Inventory::parse(INVENTORY).unwrap();

        let names: Vec<&str> = inventory.groups().iter().map(Group::name).collect();
        assert_eq!(names, vec![CONSUL_SERVERS, NOMAD_SERVERS, CLIENTS]);

        assert_eq!(
            inventory.hosts(CONSUL_SERVERS),
            vec!["116.203.48.99", "195.201.124.132", "116.203.21.77"]
        );
        assert_eq!(
            inventory.private_ips(CLIENTS).unwrap(),
            vec!["10.0.3.2", "10.0.3.3"]
        );
        assert_eq!(
            inventory.first_host(NOMAD_SERVERS).unwrap().host_name().unwrap(),
            "nomad-srv-nomad-server-1"
        );
    }

    #[test]
    fn host_names_are_distinct_across_groups() {
        let inventory = Inventory::parse(INVENTORY).unwrap();

        assert_eq!(
            inventory.host_names().unwrap(),
            vec![
                "nomad-srv-nomad-server-1",
                "nomad-srv-nomad-server-2",
                "nomad-srv-nomad-server-3",
                "nomad-srv-client-1",
                "nomad-srv-client-2",
            ]
        );
    }

    #[test]
    fn missing_groups_have_no_hosts() {
        let inventory = Inventory::parse(INVENTORY).unwrap();

        assert!(inventory.hosts(VAULT_SERVERS).is_empty());
        assert!(inventory.first_host(VAULT_SERVERS).is_none());
        assert!(inventory.private_ips(VAULT_SERVERS).unwrap().is_empty());
        assert!(matches!(
            inventory.first_private_ip(VAULT_SERVERS),
            Err(InventoryError::MissingGroup(group)) if group == VAULT_SERVERS
        ));
    }

    #[test]
    fn parsing_is_stable() {
        assert_eq!(
            Inventory::parse(INVENTORY).unwrap(),
            Inventory::parse(INVENTORY).unwrap()
        );
    }

    #[test]
    fn duplicate_hosts_are_merged() {
        let inventory = Inventory::parse(
            "[clients]\n10.0.0.1 host_name=a\n10.0.0.1 private_ip=10.1.0.1\n",
        )
        .unwrap();

        let clients = inventory.group(CLIENTS).unwrap();
        assert_eq!(clients.hosts().len(), 1);
        assert_eq!(clients.hosts()[0].host_name().unwrap(), "a");
        assert_eq!(clients.hosts()[0].private_ip().unwrap(), "10.1.0.1");
    }

    #[test]
    fn handles_ungrouped_hosts_quotes_vars_and_children() {
        let inventory = Inventory::parse(
            r#"
bastion.example.com host_name=bastion
[nomad_servers]
10.0.0.1 host_name="server one" private_ip=10.1.0.1 # first server
10.0.0.2 host_name='server-two' private_ip=10.1.0.2 ansible_user=admin

[nomad_servers:vars]
ansible_user = root

[servers:children]
nomad_servers
"#,
        )
        .unwrap();

        let bastion = inventory.first_host(UNGROUPED).unwrap();
        assert_eq!(bastion.address(), "bastion.example.com");

        let servers = inventory.group(NOMAD_SERVERS).unwrap().hosts();
        assert_eq!(servers[0].host_name().unwrap(), "server one");
        assert_eq!(servers[0].attribute("ansible_user"), Some("root"));
        assert_eq!(servers[1].attribute("ansible_user"), Some("admin"));

        assert_eq!(inventory.hosts("servers"), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(
            Inventory::parse("[clients\n"),
            Err(InventoryError::MalformedHeader { line: 1, .. })
        ));
        assert!(matches!(
            Inventory::parse("[clients:hosts]\n"),
            Err(InventoryError::MalformedHeader { line: 1, .. })
        ));
        assert!(matches!(
            Inventory::parse("[clients]\n10.0.0.1 host_name\n"),
            Err(InventoryError::MalformedAttribute { line: 2, .. })
        ));
        assert!(matches!(
            Inventory::parse("[clients]\n10.0.0.1 host_name=\"abc\n"),
            Err(InventoryError::UnterminatedQuote { line: 2 })
        ));
        assert!(matches!(
            Inventory::parse("[servers:children]\nmissing\n"),
            Err(InventoryError::UnknownChildGroup { .. })
        ));
    }

    #[test]
    fn missing_host_name_is_reported() {
        let inventory = Inventory::parse("[clients]\n10.0.0.1 private_ip=10.1.0.1\n").unwrap();

        assert!(matches!(
            inventory.host_names(),
            Err(InventoryError::MissingAttribute { address, attribute })
                if address == "10.0.0.1" && attribute == "host_name"
        ));
    }

    const TERRAFORM_OUTPUT: &str = r#"{
        "nomad_servers": {"sensitive": false, "type": ["tuple", ["string"]], "value": [
            "116.203.48.99 host_name=nomad-srv-nomad-server-1 private_ip=10.0.1.2",
            "195.201.124.132 host_name=nomad-srv-nomad-server-2 private_ip=10.0.1.3"
        ]},
        "consul_servers": {"sensitive": false, "type": ["tuple", []], "value": []},
        "client_servers": {"sensitive": false, "type": ["tuple", ["string"]], "value": [
            "159.69.147.86 host_name=nomad-srv-client-1 private_ip=10.0.3.2"
        ]},
        "o11y_servers": {"sensitive": false, "type": ["tuple", ["string"]], "value": [
            "195.201.126.249 host_name=nomad-srv-observability-1 private_ip=10.0.4.2"
        ]}
    }"#;

    #[test]
    fn generates_inventory_from_terraform_output() {
        let document = generate_inventory(TERRAFORM_OUTPUT).unwrap();

        assert_eq!(
            document,
            "[consul_servers]
116.203.48.99 host_name=nomad-srv-nomad-server-1 private_ip=10.0.1.2
195.201.124.132 host_name=nomad-srv-nomad-server-2 private_ip=10.0.1.3
[nomad_servers]
116.203.48.99 host_name=nomad-srv-nomad-server-1 private_ip=10.0.1.2
195.201.124.132 host_name=nomad-srv-nomad-server-2 private_ip=10.0.1.3
[clients]
159.69.147.86 host_name=nomad-srv-client-1 private_ip=10.0.3.2
[grafana]
195.201.126.249 host_name=nomad-srv-observability-1 private_ip=10.0.4.2
[prometheus]
195.201.126.249 host_name=nomad-srv-observability-1 private_ip=10.0.4.2
[loki]
195.201.126.249 host_name=nomad-srv-observability-1 private_ip=10.0.4.2
[tempo]
195.201.126.249 host_name=nomad-srv-observability-1 private_ip=10.0.4.2
"
        );

        let inventory = Inventory::parse(&document).unwrap();
        assert_eq!(inventory.first_private_ip(TEMPO).unwrap(), "10.0.4.2");
    }

    #[test]
    fn rejects_unexpected_observability_server_count() {
        let output = r#"{"o11y_servers": {"value": ["a host_name=a", "b host_name=b"]}}"#;

        assert!(matches!(
            generate_inventory(output),
            Err(InventoryError::TerraformOutput(_))
        ));
    }
}
