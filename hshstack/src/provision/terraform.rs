use std::path::{Path, PathBuf};

use anyhow::Context;
use common::clap::{CliSecret, PlainRedactor};
use minijinja::context;
use tokio::process::Command;

use super::subprocess::{run_subprocess, subprocess_output};
use crate::{
    config::{ClusterConfig, HetznerSettings, ObservabilityConfig},
    render::{render_template, write_file, RenderError},
};

const TERRAFORM: &str = "terraform";

#[derive(Clone, Debug)]
pub struct TerraformTemplates {
    /// Rendered with the cluster, observability and provider settings
    pub vars: String,
    /// Written as is
    pub main: String,
}

impl Default for TerraformTemplates {
    fn default() -> Self {
        Self {
            vars: include_str!("../../templates/terraform/vars.tf").to_string(),
            main: include_str!("../../templates/terraform/main.tf").to_string(),
        }
    }
}

/// Writes the Hetzner Cloud infrastructure definition of a cluster.
pub struct TerraformRenderer {
    templates: TerraformTemplates,
    terraform_dir: PathBuf,
}

impl TerraformRenderer {
    pub fn new(templates: TerraformTemplates, terraform_dir: impl AsRef<Path>) -> Self {
        Self {
            templates,
            terraform_dir: terraform_dir.as_ref().to_owned(),
        }
    }

    pub fn render(
        &self,
        cluster: &ClusterConfig,
        observability: &ObservabilityConfig,
        provider: &HetznerSettings,
    ) -> Result<(), RenderError> {
        let vars = render_template(
            "vars.tf",
            &self.templates.vars,
            context! {
                cluster => cluster,
                observability => observability,
                provider => provider,
            },
        )?;

        write_file(self.terraform_dir.join("vars.tf"), &vars)?;
        write_file(self.terraform_dir.join("main.tf"), &self.templates.main)?;

        Ok(())
    }
}

/// The terraform CLI, run inside the cluster's terraform directory.
pub struct Terraform {
    terraform_dir: PathBuf,
    hcloud_token: CliSecret<String, PlainRedactor>,
}

impl Terraform {
    pub fn new(
        terraform_dir: impl AsRef<Path>,
        hcloud_token: CliSecret<String, PlainRedactor>,
    ) -> Self {
        Self {
            terraform_dir: terraform_dir.as_ref().to_owned(),
            hcloud_token,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(TERRAFORM);
        command.current_dir(&self.terraform_dir).args(args);
        command
    }

    fn command_with_token(&self, args: &[&str]) -> Command {
        let mut command = self.command(args);
        command
            .arg("-var")
            .arg(format!("hcloud_token={}", self.hcloud_token.as_str()));
        command
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        run_subprocess(TERRAFORM, self.command(&["init", "-input=false"])).await
    }

    pub async fn apply(&self) -> anyhow::Result<()> {
        run_subprocess(
            TERRAFORM,
            self.command_with_token(&["apply", "-auto-approve", "-input=false"]),
        )
        .await
    }

    /// The outputs of the last apply, as printed by `terraform output -json`.
    pub async fn output_json(&self) -> anyhow::Result<String> {
        subprocess_output(TERRAFORM, self.command(&["output", "-json"]))
            .await
            .context("Failed to read the terraform outputs")
    }

    pub async fn destroy(&self) -> anyhow::Result<()> {
        run_subprocess(
            TERRAFORM,
            self.command_with_token(&["destroy", "-auto-approve", "-input=false"]),
        )
        .await
    }
}
