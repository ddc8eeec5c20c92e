use std::path::Path;

use tokio::process::Command;

use super::subprocess::run_subprocess;

const ANSIBLE_PLAYBOOK: &str = "ansible-playbook";

fn playbook_command(
    playbook: &Path,
    inventory: &Path,
    user: &str,
    extra_var_files: &[&Path],
) -> Command {
    let mut command = Command::new(ANSIBLE_PLAYBOOK);

    // Freshly created hosts are not in known_hosts yet
    command.env("ANSIBLE_HOST_KEY_CHECKING", "False");

    // Relative file references in the playbooks resolve against the playbook's directory
    if let Some(dir) = playbook.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command.current_dir(dir);
    }

    command.arg("-i").arg(inventory).arg("-u").arg(user);

    for file in extra_var_files {
        let mut extra_vars = std::ffi::OsString::from("@");
        extra_vars.push(file.as_os_str());
        command.arg("--extra-vars").arg(extra_vars);
    }

    command.arg(playbook);
    command
}

/// Runs `playbook` against every host in `inventory`, connecting as `user`.
///
/// Each of `extra_var_files` is loaded as variables, which is how the secrets reach the templates.
pub async fn run_playbook(
    playbook: &Path,
    inventory: &Path,
    user: &str,
    extra_var_files: &[&Path],
) -> anyhow::Result<()> {
    tracing::info!("Running playbook {}", playbook.display());

    run_subprocess(
        ANSIBLE_PLAYBOOK,
        playbook_command(playbook, inventory, user, extra_var_files),
    )
    .await
}
