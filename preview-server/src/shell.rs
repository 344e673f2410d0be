//! External command execution for install, patch and dev-server steps.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `argv` in `cwd` and collect its output.
///
/// A non-zero exit becomes `ShellError::Failed` carrying a trimmed excerpt of
/// stderr (or stdout). With a timeout, the child is killed when it elapses.
pub async fn run(
    argv: &[String],
    cwd: &Path,
    envs: &[(&str, &str)],
    timeout: Option<Duration>,
) -> Result<CommandOutput, ShellError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ShellError::EmptyCommand);
    };
    let display = argv.join(" ");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    tracing::debug!(cwd = %cwd.display(), "Running command: {}", argv.join(" "));

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
            Ok(result) => result,
            Err(_) => {
                return Err(ShellError::Timeout {
                    command: display,
                    timeout: limit,
                });
            }
        },
        None => cmd.output().await,
    }
    .map_err(|source| ShellError::Spawn {
        command: display.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(ShellError::Failed(format_process_failure(
            &format!("'{display}' failed"),
            output.status,
            &output.stdout,
            &output.stderr,
        )));
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

pub fn format_process_failure(
    context: &str,
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
) -> String {
    let status_text = match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };

    let stderr_text = String::from_utf8_lossy(stderr).trim().to_string();
    let stdout_text = String::from_utf8_lossy(stdout).trim().to_string();
    let detail = if !stderr_text.is_empty() {
        stderr_text
    } else {
        stdout_text
    };

    if detail.is_empty() {
        return format!("{context} ({status_text})");
    }

    let preview: String = detail.chars().take(400).collect();
    if detail.chars().count() > 400 {
        format!("{context} ({status_text}): {preview}...")
    } else {
        format!("{context} ({status_text}): {preview}")
    }
}
