use std::{fs, path::Path};

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{Consul, ConsulError};
use crate::{
    inventory::{Inventory, CONSUL_SERVERS},
    secrets::pki::ConsulCertificates,
};

const CONSUL_HTTPS_PORT: u16 = 8501;

/// Consul answers a repeated bootstrap with a 403 carrying this message.
const BOOTSTRAP_NO_LONGER_ALLOWED: &str = "ACL bootstrap no longer allowed";

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "ID")]
    id: Option<&'a str>,
    name: &'a str,
    rules: &'a str,
}

#[derive(Deserialize)]
struct PolicyResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyLink<'a> {
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TokenRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "AccessorID")]
    accessor_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    policies: Vec<PolicyLink<'a>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "SecretID")]
    secret_id: String,
}

pub struct ConsulHttpClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulHttpClient {
    /// Client for the HTTPS API of the first host in the `consul_servers` group.
    ///
    /// The server certificate is verified against the cluster CA. It names the server
    /// role rather than the host, so the host name is not checked.
    pub fn new(
        inventory: &Inventory,
        certificates: &ConsulCertificates,
    ) -> Result<Self, ConsulError> {
        let server = inventory
            .first_host(CONSUL_SERVERS)
            .ok_or_else(|| ConsulError::NoServersFound(CONSUL_SERVERS.to_string()))?;

        let ca_cert = read(&certificates.ca.cert)?;
        let cli_cert = read(&certificates.cli.cert)?;
        let cli_key = read(&certificates.cli.key)?;

        // We set the max number of allowed idle connections to 0 to avoid
        // a race condition where a connection is selected from the pool and
        // written to at the same time the server is closing it.
        // More details here:
        // https://github.com/hyperium/hyper/issues/2136#issuecomment-589345238
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .add_root_certificate(Certificate::from_pem(&ca_cert)?)
            .identity(Identity::from_pkcs8_pem(&cli_cert, &cli_key)?)
            .danger_accept_invalid_hostnames(true)
            .build()?;

        Ok(Self::with_client(
            client,
            format!("https://{}:{}", server.address(), CONSUL_HTTPS_PORT),
        ))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, self.url(path));

        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn policy_id(&self, name: &str) -> Result<String, ConsulError> {
        let resp = self
            .request(Method::GET, &format!("acl/policy/name/{name}"))
            .send()
            .await?;

        let policy: PolicyResponse = handle_response_json(resp).await?;
        Ok(policy.id)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ConsulError> {
    fs::read(path).map_err(|source| ConsulError::Io {
        path: path.to_owned(),
        source,
    })
}

fn read_rules(path: &Path) -> Result<String, ConsulError> {
    fs::read_to_string(path).map_err(|source| ConsulError::Io {
        path: path.to_owned(),
        source,
    })
}

fn read_definition(path: &Path) -> Result<serde_json::Value, ConsulError> {
    let contents = read(path)?;
    serde_json::from_slice(&contents).map_err(|source| ConsulError::InvalidDefinition {
        path: path.to_owned(),
        source,
    })
}

fn is_already_bootstrapped(status: StatusCode, body: &str) -> bool {
    status == StatusCode::FORBIDDEN && body.contains(BOOTSTRAP_NO_LONGER_ALLOWED)
}

async fn handle_error<T>(resp: Response) -> Result<T, ConsulError> {
    let status = resp.status();
    let error_text = resp.text().await?;
    tracing::error!("Error {}: {}", status, error_text);
    Err(ConsulError::Api(status, error_text))
}

/// Use this when you don't need anything from the response body but just want to capture errors
async fn handle_response(resp: Response) -> Result<(), ConsulError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        handle_error(resp).await
    }
}

/// Turns the response to Json and captures errors
async fn handle_response_json<T>(resp: Response) -> Result<T, ConsulError>
where
    T: DeserializeOwned,
{
    if resp.status().is_success() {
        let json = resp.json().await?;
        Ok(json)
    } else {
        handle_error(resp).await
    }
}

#[async_trait]
impl Consul for ConsulHttpClient {
    fn authenticate(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    async fn bootstrap(&mut self) -> Result<String, ConsulError> {
        let resp = self.request(Method::PUT, "acl/bootstrap").send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            if is_already_bootstrapped(status, &body) {
                return Err(ConsulError::AlreadyBootstrapped);
            }

            tracing::error!("Error {}: {}", status, body);
            return Err(ConsulError::Api(status, body));
        }

        let token: TokenResponse = resp.json().await?;
        self.authenticate(&token.secret_id);

        Ok(token.secret_id)
    }

    async fn register_policy(&self, name: &str, rule_file: &Path) -> Result<(), ConsulError> {
        let rules = read_rules(rule_file)?;

        let resp = self
            .request(Method::PUT, "acl/policy")
            .json(&PolicyRequest {
                id: None,
                name,
                rules: &rules,
            })
            .send()
            .await?;

        handle_response(resp).await
    }

    async fn update_policy(&self, name: &str, rule_file: &Path) -> Result<(), ConsulError> {
        let rules = read_rules(rule_file)?;
        let id = self.policy_id(name).await?;

        let resp = self
            .request(Method::PUT, &format!("acl/policy/{id}"))
            .json(&PolicyRequest {
                id: Some(&id),
                name,
                rules: &rules,
            })
            .send()
            .await?;

        handle_response(resp).await
    }

    async fn register_acl(
        &self,
        description: &str,
        policy_name: &str,
    ) -> Result<String, ConsulError> {
        let resp = self
            .request(Method::PUT, "acl/token")
            .json(&TokenRequest {
                accessor_id: None,
                description: Some(description),
                policies: vec![PolicyLink { name: policy_name }],
            })
            .send()
            .await?;

        let token: TokenResponse = handle_response_json(resp).await?;
        Ok(token.secret_id)
    }

    async fn update_acl(&self, principal_id: &str, policy_name: &str) -> Result<(), ConsulError> {
        let resp = self
            .request(Method::PUT, &format!("acl/token/{principal_id}"))
            .json(&TokenRequest {
                accessor_id: Some(principal_id),
                description: None,
                policies: vec![PolicyLink { name: policy_name }],
            })
            .send()
            .await?;

        handle_response(resp).await
    }

    async fn register_service(&self, service_file: &Path) -> Result<(), ConsulError> {
        let service = read_definition(service_file)?;

        let resp = self
            .request(Method::PUT, "agent/service/register")
            .json(&service)
            .send()
            .await?;

        handle_response(resp).await
    }

    async fn register_intention(&self, intention_file: &Path) -> Result<(), ConsulError> {
        let intention = read_definition(intention_file)?;

        let resp = self
            .request(Method::PUT, "config")
            .json(&intention)
            .send()
            .await?;

        handle_response(resp).await
    }
}
