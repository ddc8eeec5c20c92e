use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Runs `command` to completion, forwarding its output line by line to the log.
pub async fn run_subprocess(name: &'static str, mut command: Command) -> anyhow::Result<()> {
    let mut child = command
        .kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {name}"))?;

    let child_id = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("Failed to get child process id"))?;
    tracing::debug!("{name} started. {name} process id: {child_id}");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("{name} stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("{name} stderr was not captured"))?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();

    let stdout_task = tokio::spawn(async move {
        while let Some(line) = stdout_reader.next_line().await.unwrap_or(None) {
            tracing::info!("{name} stdout: {line}");
        }
    });

    let stderr_task = tokio::spawn(async move {
        while let Some(line) = stderr_reader.next_line().await.unwrap_or(None) {
            tracing::warn!("{name} stderr: {line}");
        }
    });

    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for {name}"))?;

    // Drain whatever is left in the pipes before reporting
    let _ = tokio::join!(stdout_task, stderr_task);

    if !status.success() {
        anyhow::bail!("{name} exited with {status}");
    }

    Ok(())
}

/// Runs `command` to completion and returns its stdout. Stderr goes to the log.
pub async fn subprocess_output(name: &'static str, mut command: Command) -> anyhow::Result<String> {
    let output = command
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {name}"))?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        tracing::warn!("{name} stderr: {line}");
    }

    if !output.status.success() {
        anyhow::bail!("{name} exited with {}", output.status);
    }

    String::from_utf8(output.stdout).with_context(|| format!("{name} printed invalid UTF-8"))
}
