//! Workspace manager - one git working copy per site

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{CommandTemplate, OrchestratorConfig};
use crate::git::{GitCli, GitError, inject_credentials, redact_credentials};
use crate::shell::{self, ShellError};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to prepare workspace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} exists but is not a git working copy")]
    NotARepository(PathBuf),
    #[error("git: {0}")]
    Git(#[from] GitError),
    #[error("dependency install failed: {0}")]
    Install(#[from] ShellError),
}

/// What `ensure` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub cloned: bool,
    pub installed: bool,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: GitCli,
    source_host: String,
    token: Option<String>,
    install_command: CommandTemplate,
    install_marker: String,
    install_timeout: Duration,
}

impl WorkspaceManager {
    pub fn new(config: &OrchestratorConfig, git: GitCli) -> Self {
        Self {
            git,
            source_host: config.source_host.clone(),
            token: config.github_token.clone(),
            install_command: config.install_command.clone(),
            install_marker: config.install_marker.clone(),
            install_timeout: config.install_timeout,
        }
    }

    /// Make `path` a working copy of `branch` at the remote tip.
    ///
    /// Existing copies are fetched and hard-reset, discarding local edits.
    /// Dependencies are installed when the install marker is missing.
    pub async fn ensure(
        &self,
        path: &Path,
        repo_url: &str,
        branch: &str,
    ) -> Result<EnsureOutcome, WorkspaceError> {
        let url = inject_credentials(repo_url, &self.source_host, self.token.as_deref());
        let cloned = if path.join(".git").exists() {
            tracing::info!(workspace = %path.display(), branch = %branch, "Resetting workspace to remote");
            // Keep the remote current so a rotated token or new repo URL takes effect.
            self.git.set_remote_url(path, &url).await?;
            self.git.reset_to_remote(path, branch).await?;
            false
        } else {
            if path.exists() && !dir_is_empty(path)? {
                return Err(WorkspaceError::NotARepository(path.to_path_buf()));
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| WorkspaceError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            tracing::info!(
                workspace = %path.display(),
                repo = %redact_credentials(&url),
                branch = %branch,
                "Cloning workspace"
            );
            self.git.clone_shallow(&url, branch, path).await?;
            true
        };

        let installed = self.install_if_missing(path).await?;
        Ok(EnsureOutcome { cloned, installed })
    }

    /// Run the install command unless the marker directory already exists.
    pub async fn install_if_missing(&self, path: &Path) -> Result<bool, WorkspaceError> {
        if path.join(&self.install_marker).exists() {
            return Ok(false);
        }
        tracing::info!(workspace = %path.display(), command = %self.install_command, "Installing dependencies");
        let argv = self.install_command.render(None);
        shell::run(&argv, path, &[], Some(self.install_timeout)).await?;
        Ok(true)
    }
}

fn dir_is_empty(path: &Path) -> Result<bool, WorkspaceError> {
    let mut entries = std::fs::read_dir(path).map_err(|source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(entries.next().is_none())
}
