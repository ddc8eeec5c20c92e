//! The secrets file is the single durable record of every secret the cluster depends on.
//!
//! It is always written in full: load the record, change it in memory, persist it.
//! Once a field holds a real value it is never replaced, so running nodes stay in sync
//! with what is stored here.

pub mod pki;

use std::{
    fmt,
    fs::{self, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Placeholder for a token that has not been issued yet.
pub const SENTINEL: &str = "TBD";

const SECRETS_DIR: &str = "secrets";
const SECRETS_FILE: &str = "secrets.yml";

const SECRETS_DIR_PERMISSIONS: u32 = 0o700;
const SECRETS_FILE_PERMISSIONS: u32 = 0o600;

/// Consul and Nomad both expect a base64 encoded 32 byte key.
const GOSSIP_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Secrets file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed secrets file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Refusing to overwrite {0} which has already been issued")]
    AlreadyIssued(AclToken),
    #[error(
        "No secrets file at {0} and no object storage credentials to create one, \
         set S3_ENDPOINT, S3_ACCESS_KEY and S3_SECRET_KEY"
    )]
    MissingObjectStorageCredentials(PathBuf),
}

/// The ACL tokens held in the record, which start out as [`SENTINEL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AclToken {
    Bootstrap,
    Agent,
    NomadClient,
    NomadServer,
    Prometheus,
}

impl AclToken {
    /// The key of the token in the secrets file, which the playbooks also use as a variable name.
    pub fn key(&self) -> &'static str {
        match self {
            AclToken::Bootstrap => "CONSUL_BOOTSTRAP_TOKEN",
            AclToken::Agent => "CONSUL_AGENT_TOKEN",
            AclToken::NomadClient => "NOMAD_CLIENT_CONSUL_TOKEN",
            AclToken::NomadServer => "NOMAD_SERVER_CONSUL_TOKEN",
            AclToken::Prometheus => "PROMETHEUS_CONSUL_TOKEN",
        }
    }
}

impl fmt::Display for AclToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Object storage used by loki and tempo.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ObjectStorageCredentials {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for ObjectStorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageCredentials")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<REDACTED>")
            .finish()
    }
}

fn sentinel() -> String {
    SENTINEL.to_string()
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsRecord {
    #[serde(rename = "CONSUL_GOSSIP_KEY")]
    consul_gossip_key: String,
    #[serde(rename = "NOMAD_GOSSIP_KEY")]
    nomad_gossip_key: String,
    #[serde(rename = "NOMAD_CLIENT_CONSUL_TOKEN", default = "sentinel")]
    nomad_client_consul_token: String,
    #[serde(rename = "NOMAD_SERVER_CONSUL_TOKEN", default = "sentinel")]
    nomad_server_consul_token: String,
    #[serde(rename = "CONSUL_AGENT_TOKEN", default = "sentinel")]
    consul_agent_token: String,
    #[serde(rename = "CONSUL_BOOTSTRAP_TOKEN", default = "sentinel")]
    consul_bootstrap_token: String,
    #[serde(rename = "PROMETHEUS_CONSUL_TOKEN", default = "sentinel")]
    prometheus_consul_token: String,
    #[serde(default)]
    s3_endpoint: String,
    #[serde(default)]
    s3_access_key: String,
    #[serde(default)]
    s3_secret_key: String,
}

impl SecretsRecord {
    /// Creates the record for a new cluster with fresh gossip keys and no tokens.
    pub fn generate(credentials: ObjectStorageCredentials) -> Self {
        Self {
            consul_gossip_key: generate_gossip_key(),
            nomad_gossip_key: generate_gossip_key(),
            nomad_client_consul_token: sentinel(),
            nomad_server_consul_token: sentinel(),
            consul_agent_token: sentinel(),
            consul_bootstrap_token: sentinel(),
            prometheus_consul_token: sentinel(),
            s3_endpoint: credentials.endpoint,
            s3_access_key: credentials.access_key,
            s3_secret_key: credentials.secret_key,
        }
    }

    pub fn consul_gossip_key(&self) -> &str {
        &self.consul_gossip_key
    }

    pub fn nomad_gossip_key(&self) -> &str {
        &self.nomad_gossip_key
    }

    pub fn object_storage(&self) -> ObjectStorageCredentials {
        ObjectStorageCredentials {
            endpoint: self.s3_endpoint.clone(),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
        }
    }

    fn token_field(&self, token: AclToken) -> &String {
        match token {
            AclToken::Bootstrap => &self.consul_bootstrap_token,
            AclToken::Agent => &self.consul_agent_token,
            AclToken::NomadClient => &self.nomad_client_consul_token,
            AclToken::NomadServer => &self.nomad_server_consul_token,
            AclToken::Prometheus => &self.prometheus_consul_token,
        }
    }

    fn token_field_mut(&mut self, token: AclToken) -> &mut String {
        match token {
            AclToken::Bootstrap => &mut self.consul_bootstrap_token,
            AclToken::Agent => &mut self.consul_agent_token,
            AclToken::NomadClient => &mut self.nomad_client_consul_token,
            AclToken::NomadServer => &mut self.nomad_server_consul_token,
            AclToken::Prometheus => &mut self.prometheus_consul_token,
        }
    }

    /// The token value, or `None` while it still holds the sentinel.
    pub fn token(&self, token: AclToken) -> Option<&str> {
        let value = self.token_field(token);
        (value != SENTINEL).then_some(value.as_str())
    }

    pub fn is_issued(&self, token: AclToken) -> bool {
        self.token(token).is_some()
    }

    /// Records a newly issued token. A token that has already been issued is never replaced.
    pub fn issue(&mut self, token: AclToken, value: impl Into<String>) -> Result<(), SecretsError> {
        if self.is_issued(token) {
            return Err(SecretsError::AlreadyIssued(token));
        }

        *self.token_field_mut(token) = value.into();
        Ok(())
    }
}

impl fmt::Debug for SecretsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = |token| {
            if self.is_issued(token) {
                "<ISSUED>"
            } else {
                SENTINEL
            }
        };

        f.debug_struct("SecretsRecord")
            .field("consul_gossip_key", &"<REDACTED>")
            .field("nomad_gossip_key", &"<REDACTED>")
            .field("consul_bootstrap_token", &status(AclToken::Bootstrap))
            .field("consul_agent_token", &status(AclToken::Agent))
            .field("nomad_client_consul_token", &status(AclToken::NomadClient))
            .field("nomad_server_consul_token", &status(AclToken::NomadServer))
            .field("prometheus_consul_token", &status(AclToken::Prometheus))
            .field("object_storage", &self.object_storage())
            .finish()
    }
}

fn generate_gossip_key() -> String {
    let mut key = [0u8; GOSSIP_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Location of the secrets file of one cluster.
#[derive(Clone, Debug)]
pub struct SecretsStore {
    path: PathBuf,
}

impl SecretsStore {
    /// The store at its fixed place below the cluster's base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            path: secrets_dir(base_dir).join(SECRETS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> SecretsError {
        SecretsError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Loads the record. `None` means no record has been created yet, i.e. this is a first run.
    pub fn load(&self) -> Result<Option<SecretsRecord>, SecretsError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let record = serde_yaml::from_str(&contents).map_err(|source| SecretsError::Yaml {
            path: self.path.clone(),
            source,
        })?;

        Ok(Some(record))
    }

    /// Replaces the whole file with `record`, readable by the owner only.
    pub fn persist(&self, record: &SecretsRecord) -> Result<(), SecretsError> {
        let contents = serde_yaml::to_string(record).map_err(|source| SecretsError::Yaml {
            path: self.path.clone(),
            source,
        })?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| self.io_error(io::Error::other("secrets path has no parent")))?;

        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
            fs::set_permissions(dir, Permissions::from_mode(SECRETS_DIR_PERMISSIONS))
                .map_err(|e| self.io_error(e))?;
        }

        let mut temp = NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        temp.write_all(contents.as_bytes())
            .map_err(|e| self.io_error(e))?;
        temp.as_file()
            .set_permissions(Permissions::from_mode(SECRETS_FILE_PERMISSIONS))
            .map_err(|e| self.io_error(e))?;
        temp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        temp.persist(&self.path)
            .map_err(|err| self.io_error(err.error))?;

        Ok(())
    }
}

/// Directory holding the secrets file and the generated certificates.
pub fn secrets_dir(base_dir: impl AsRef<Path>) -> PathBuf {
    base_dir.as_ref().join(SECRETS_DIR)
}

/// Loads the record or, on the very first run, creates and persists it.
///
/// `credentials` are only needed for that first run. An existing record is returned
/// untouched, even when `credentials` differ from what is stored.
pub fn ensure_secrets(
    store: &SecretsStore,
    credentials: Option<ObjectStorageCredentials>,
) -> Result<SecretsRecord, SecretsError> {
    if let Some(record) = store.load()? {
        tracing::debug!("Using existing secrets from {}", store.path().display());
        return Ok(record);
    }

    let credentials = credentials
        .ok_or_else(|| SecretsError::MissingObjectStorageCredentials(store.path().to_owned()))?;

    tracing::info!("Generating new secrets in {}", store.path().display());
    let record = SecretsRecord::generate(credentials);
    store.persist(&record)?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ALL_TOKENS: [AclToken; 5] = [
        AclToken::Bootstrap,
        AclToken::Agent,
        AclToken::NomadClient,
        AclToken::NomadServer,
        AclToken::Prometheus,
    ];

    fn credentials() -> ObjectStorageCredentials {
        ObjectStorageCredentials {
            endpoint: "https://fsn1.your-objectstorage.com".to_string(),
            access_key: "access".to_string(),
            secret_key: "secret".to_string(),
        }
    }

    #[test]
    fn load_without_file_signals_first_run() {
        let dir = tempdir().unwrap();
        let store = SecretsStore::new(dir.path());

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn fresh_record_has_only_sentinel_tokens() {
        let record = SecretsRecord::generate(credentials());

        for token in ALL_TOKENS {
            assert!(!record.is_issued(token), "{token} should not be issued");
        }
        assert_ne!(record.consul_gossip_key(), record.nomad_gossip_key());
        assert_eq!(STANDARD.decode(record.consul_gossip_key()).unwrap().len(), 32);
        assert_eq!(record.object_storage(), credentials());
    }

    #[test]
    fn issued_tokens_are_never_replaced() {
        let mut record = SecretsRecord::generate(credentials());

        record.issue(AclToken::Agent, "first").unwrap();
        let result = record.issue(AclToken::Agent, "second");

        assert!(matches!(
            result,
            Err(SecretsError::AlreadyIssued(AclToken::Agent))
        ));
        assert_eq!(record.token(AclToken::Agent), Some("first"));
    }

    #[test]
    fn persisted_record_is_owner_only_and_loads_back() {
        let dir = tempdir().unwrap();
        let store = SecretsStore::new(dir.path());

        let mut record = SecretsRecord::generate(credentials());
        record.issue(AclToken::Bootstrap, "bootstrap-secret").unwrap();
        store.persist(&record).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        assert_eq!(store.load().unwrap(), Some(record));
    }

    #[test]
    fn reads_existing_file_layout() {
        let dir = tempdir().unwrap();
        let store = SecretsStore::new(dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();

        // Files written before the prometheus token existed lack that key
        fs::write(
            store.path(),
            "CONSUL_GOSSIP_KEY: consul-key\n\
             NOMAD_GOSSIP_KEY: nomad-key\n\
             NOMAD_CLIENT_CONSUL_TOKEN: TBD\n\
             NOMAD_SERVER_CONSUL_TOKEN: TBD\n\
             CONSUL_AGENT_TOKEN: TBD\n\
             CONSUL_BOOTSTRAP_TOKEN: 9f0f6d2e\n\
             s3_endpoint: https://s3.local\n",
        )
        .unwrap();

        let record = store.load().unwrap().unwrap();
        assert_eq!(record.consul_gossip_key(), "consul-key");
        assert_eq!(record.token(AclToken::Bootstrap), Some("9f0f6d2e"));
        assert_eq!(record.token(AclToken::Prometheus), None);
        assert_eq!(record.object_storage().endpoint, "https://s3.local");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let store = SecretsStore::new(dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "- not\n- a\n- record\n").unwrap();

        assert!(matches!(store.load(), Err(SecretsError::Yaml { .. })));
    }

    #[test]
    fn ensure_secrets_generates_once() {
        let dir = tempdir().unwrap();
        let store = SecretsStore::new(dir.path());

        let first = ensure_secrets(&store, Some(credentials())).unwrap();
        let second = ensure_secrets(&store, Some(ObjectStorageCredentials::default())).unwrap();
        let third = ensure_secrets(&store, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(store.load().unwrap(), Some(first));
    }

    #[test]
    fn new_record_needs_object_storage_credentials() {
        let dir = tempdir().unwrap();
        let store = SecretsStore::new(dir.path());

        let result = ensure_secrets(&store, None);

        assert!(matches!(
            result,
            Err(SecretsError::MissingObjectStorageCredentials(path)) if path == store.path()
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let mut record = SecretsRecord::generate(credentials());
        record.issue(AclToken::Agent, "agent-secret").unwrap();

        let debug = format!("{record:?}");

        assert!(!debug.contains("agent-secret"));
        assert!(!debug.contains(record.consul_gossip_key()));
        assert!(!debug.contains("\"secret\""));
        assert!(debug.contains("<ISSUED>"));
    }
}
