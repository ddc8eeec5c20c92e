use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use common::clap::{CliSecret, PlainRedactor, UrlPasswordRedactor};
use hshstack::secrets::ObjectStorageCredentials;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct HetznerArgs {
    /// API token of the Hetzner Cloud project the cluster lives in
    #[clap(long, env = "HETZNER_TOKEN")]
    pub hetzner_token: CliSecret<String, PlainRedactor>,
}

/// Object storage for loki and tempo. Only needed when the secrets file is first created.
#[derive(Args, Debug)]
pub struct ObjectStorageArgs {
    #[clap(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<CliSecret<String, UrlPasswordRedactor>>,
    #[clap(long, env = "S3_ACCESS_KEY")]
    pub s3_access_key: Option<CliSecret<String, PlainRedactor>>,
    #[clap(long, env = "S3_SECRET_KEY")]
    pub s3_secret_key: Option<CliSecret<String, PlainRedactor>>,
}

impl ObjectStorageArgs {
    /// `None` when none of the values were given. Giving only some of them is an error.
    pub fn into_credentials(self) -> anyhow::Result<Option<ObjectStorageCredentials>> {
        match (self.s3_endpoint, self.s3_access_key, self.s3_secret_key) {
            (Some(endpoint), Some(access_key), Some(secret_key)) => {
                Ok(Some(ObjectStorageCredentials {
                    endpoint: endpoint.into_inner(),
                    access_key: access_key.into_inner(),
                    secret_key: secret_key.into_inner(),
                }))
            }
            (None, None, None) => Ok(None),
            _ => anyhow::bail!(
                "S3_ENDPOINT, S3_ACCESS_KEY and S3_SECRET_KEY must be given together"
            ),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or update the infrastructure, configure every node and bootstrap the cluster.
    ///
    /// Safe to run again: an already bootstrapped cluster only has its policies updated.
    Sync {
        /// Path to the cluster config file
        #[clap(long)]
        config_file: PathBuf,
        #[command(flatten)]
        hetzner: HetznerArgs,
        #[command(flatten)]
        object_storage: ObjectStorageArgs,
    },
    /// Bootstrap the ACL system of an already provisioned cluster, or update its
    /// policies if it has been bootstrapped before
    Bootstrap {
        /// Path to the cluster config file
        #[clap(long)]
        config_file: PathBuf,
        #[command(flatten)]
        object_storage: ObjectStorageArgs,
    },
    /// Register the monitoring services with the service mesh and install them
    Observability {
        /// Path to the cluster config file
        #[clap(long)]
        config_file: PathBuf,
    },
    /// Tear down the cluster and delete all of its servers
    Destroy {
        /// Path to the cluster config file
        #[clap(long)]
        config_file: PathBuf,
        #[command(flatten)]
        hetzner: HetznerArgs,
        /// Automatic yes to prompts. Assume "yes" as answer to all prompts and run non-interactively.
        #[clap(short = 'y', long = "assume-yes")]
        assume_yes: bool,
    },
}
