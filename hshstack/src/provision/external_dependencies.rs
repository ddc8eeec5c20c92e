use std::process::Command;

pub struct ExternalDependency {
    pub binary: &'static str,
    pub install_advice: &'static str,
}

impl ExternalDependency {
    pub const fn new(binary: &'static str, install_advice: &'static str) -> Self {
        Self {
            binary,
            install_advice,
        }
    }
}

pub const TERRAFORM: ExternalDependency = ExternalDependency::new(
    "terraform",
    "Follow instructions on: https://developer.hashicorp.com/terraform/install",
);

pub const ANSIBLE_PLAYBOOK: ExternalDependency = ExternalDependency::new(
    "ansible-playbook",
    "Follow instructions on: https://docs.ansible.com/ansible/latest/installation_guide/intro_installation.html",
);

const DEPENDENCIES: [ExternalDependency; 2] = [TERRAFORM, ANSIBLE_PLAYBOOK];

fn missing_dependencies(
    dependencies: &[ExternalDependency],
) -> anyhow::Result<Vec<&ExternalDependency>> {
    let mut missing = Vec::new();

    for dep in dependencies {
        let command = Command::new("which").arg(dep.binary).output()?;

        if !command.status.success() {
            missing.push(dep);
        }
    }

    Ok(missing)
}

pub fn check_dependencies() -> anyhow::Result<()> {
    let missing = missing_dependencies(&DEPENDENCIES)?;

    for dep in &missing {
        tracing::error!(
            "Binary '{}' not found or not executable. {}",
            dep.binary,
            dep.install_advice
        );
    }

    if !missing.is_empty() {
        anyhow::bail!("One or more missing dependencies found.")
    }

    Ok(())
}
