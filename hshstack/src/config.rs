use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SUPPORTED_PROVIDER: &str = "hetzner";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0} is not a supported cloud provider")]
    UnsupportedProvider(String),
    #[error("Malformed provider_settings: {0}")]
    ProviderSettings(#[source] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// The cluster description an operator keeps next to the generated artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dc_name: String,
    #[serde(rename = "baseDir")]
    pub base_dir: PathBuf,
    pub cloud_provider_config: CloudProviderConfig,
    pub cluster_config: ClusterConfig,
    #[serde(default)]
    pub observability_config: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProviderConfig {
    #[serde(rename = "sudo_user")]
    pub user: String,
    #[serde(rename = "internal_network_interface_name")]
    pub network_interface: String,
    pub provider: String,
    #[serde(default)]
    pub provider_settings: serde_yaml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub servers: u32,
    pub clients: u32,
    #[serde(default)]
    pub separate_consul_servers: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub tempo_bucket: String,
    #[serde(default)]
    pub loki_bucket: String,
    #[serde(default)]
    pub multi_instance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerSettings {
    pub location: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    pub server_type: String,
    pub resource_names: HetznerResourceNames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerResourceNames {
    pub base_server_name: String,
    pub firewall_name: String,
    pub network_name: String,
}

impl Config {
    /// Reads and validates the config file.
    ///
    /// A relative `baseDir` is resolved against the directory holding the config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        let mut config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
                path: path.to_owned(),
                source,
            })?;

        if config.base_dir.is_relative() {
            let config_dir = path.parent().unwrap_or_else(|| Path::new(""));
            config.base_dir = config_dir.join(&config.base_dir);
        }

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let valid_dc_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if self.dc_name.is_empty() || !self.dc_name.chars().all(valid_dc_char) {
            return Err(ConfigError::Invalid(format!(
                "dc_name '{}' must be a non-empty name made of letters, digits, '-' and '_'",
                self.dc_name
            )));
        }

        if self.cluster_config.servers == 0 {
            return Err(ConfigError::Invalid(
                "cluster_config.servers must be at least 1".to_string(),
            ));
        }

        self.hetzner_settings()?;

        Ok(())
    }

    pub fn hetzner_settings(&self) -> Result<HetznerSettings, ConfigError> {
        let provider = &self.cloud_provider_config.provider;
        if provider != SUPPORTED_PROVIDER {
            return Err(ConfigError::UnsupportedProvider(provider.clone()));
        }

        serde_yaml::from_value(self.cloud_provider_config.provider_settings.clone())
            .map_err(ConfigError::ProviderSettings)
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.base_dir.join("inventory")
    }

    pub fn terraform_dir(&self) -> PathBuf {
        self.base_dir.join("terraform")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub const CONFIG: &str = r#"
dc_name: hetzner
baseDir: ./cluster
cloud_provider_config:
  sudo_user: root
  internal_network_interface_name: ens10
  provider: hetzner
  provider_settings:
    location: nbg1
    ssh_keys:
      - operator@example.com
    allowed_ips:
      - 85.4.84.201/32
    server_type: cx21
    resource_names:
      base_server_name: nomad-srv
      firewall_name: dev_firewall
      network_name: dev_network
cluster_config:
  servers: 3
  clients: 2
  separate_consul_servers: false
observability_config:
  tempo_bucket: tempo
  loki_bucket: loki
  multi_instance: false
"#;

    #[test]
    fn loads_config_and_resolves_base_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, CONFIG).unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.dc_name, "hetzner");
        assert_eq!(config.base_dir, dir.path().join("./cluster"));
        assert_eq!(config.inventory_path(), dir.path().join("./cluster/inventory"));
        assert_eq!(config.cluster_config.servers, 3);
        assert_eq!(config.cloud_provider_config.network_interface, "ens10");

        let hetzner = config.hetzner_settings().unwrap();
        assert_eq!(hetzner.location, "nbg1");
        assert_eq!(hetzner.resource_names.base_server_name, "nomad-srv");
    }

    #[test]
    fn rejects_unsupported_provider() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, CONFIG.replace("provider: hetzner", "provider: aws")).unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::UnsupportedProvider(provider)) if provider == "aws"
        ));
    }

    #[test]
    fn rejects_invalid_dc_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, CONFIG.replace("dc_name: hetzner", "dc_name: \"dc one\"")).unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempdir().unwrap();

        assert!(matches!(
            Config::load(dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
