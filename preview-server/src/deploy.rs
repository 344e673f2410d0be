//! Deploy/promote flow - commit workspace changes and push them upstream

use std::path::Path;

use chrono::Utc;
use preview_core::DeployMode;

use crate::defaults;
use crate::git::{GitCli, GitError, parse_remote_repo, redact_credentials};
use crate::github::GitHubClient;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("git: {0}")]
    Git(#[from] GitError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    pub pr_url: Option<String>,
    pub message: Option<String>,
    pub branch: Option<String>,
    pub warnings: Vec<String>,
}

pub struct Deployer {
    git: GitCli,
    trunk: String,
    source_host: String,
    github: Option<GitHubClient>,
}

impl Deployer {
    pub fn new(git: GitCli, trunk: String, source_host: String, github: Option<GitHubClient>) -> Self {
        Self {
            git,
            trunk,
            source_host,
            github,
        }
    }

    /// Commit everything in the workspace and promote it according to `mode`.
    pub async fn deploy(
        &self,
        workspace: &Path,
        mode: DeployMode,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<DeployOutcome, DeployError> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(defaults::DEFAULT_COMMIT_MESSAGE);

        self.git.add_all(workspace).await?;
        self.git.commit(workspace, title).await?;

        match mode {
            DeployMode::Merge => self.merge(workspace).await,
            DeployMode::Pr => {
                let body = body
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .unwrap_or(defaults::DEFAULT_PR_BODY);
                self.pull_request(workspace, title, body).await
            }
        }
    }

    async fn merge(&self, workspace: &Path) -> Result<DeployOutcome, DeployError> {
        let refspec = format!("HEAD:refs/heads/{}", self.trunk);
        self.git.push(workspace, &refspec).await?;
        tracing::info!(workspace = %workspace.display(), trunk = %self.trunk, "Pushed changes to trunk");
        Ok(DeployOutcome {
            message: Some(format!("Changes pushed to {}", self.trunk)),
            ..Default::default()
        })
    }

    async fn pull_request(&self, workspace: &Path, title: &str, body: &str) -> Result<DeployOutcome, DeployError> {
        let branch = format!("{}{}", defaults::PR_BRANCH_PREFIX, Utc::now().timestamp_millis());
        self.git.checkout_new_branch(workspace, &branch).await?;

        let result = self.push_and_open(workspace, &branch, title, body).await;

        // Leave the workspace on trunk whatever happened above.
        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.return_to_trunk(workspace).await;
                return Err(e);
            }
        };
        if let Some(warning) = self.return_to_trunk(workspace).await {
            outcome.warnings.push(warning);
        }
        Ok(outcome)
    }

    async fn push_and_open(
        &self,
        workspace: &Path,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<DeployOutcome, DeployError> {
        self.git.push_branch(workspace, branch).await?;
        tracing::info!(workspace = %workspace.display(), branch = %branch, "Pushed preview branch");

        let mut outcome = DeployOutcome {
            branch: Some(branch.to_string()),
            ..Default::default()
        };

        let remote = self.git.remote_url(workspace).await?;
        let repo = parse_remote_repo(&remote, &self.source_host);
        let (Some(github), Some((owner, name))) = (self.github.as_ref(), repo) else {
            outcome.message = Some("Branch pushed, create the pull request manually".to_string());
            return Ok(outcome);
        };

        match github
            .create_pull_request(&owner, &name, branch, &self.trunk, title, body)
            .await
        {
            Ok(Some(url)) => {
                tracing::info!(branch = %branch, pr = %url, "Opened pull request");
                outcome.pr_url = Some(url);
            }
            Ok(None) => {
                outcome
                    .warnings
                    .push("pull request response did not include html_url".to_string());
            }
            Err(e) => {
                let message = redact_credentials(&e.to_string());
                tracing::warn!(branch = %branch, "Failed to open pull request: {}", message);
                outcome
                    .warnings
                    .push(format!("failed to open pull request: {message}"));
            }
        }
        Ok(outcome)
    }

    /// Check trunk back out. Clones of another branch have no local trunk,
    /// so fall back to fetching it from origin.
    async fn return_to_trunk(&self, workspace: &Path) -> Option<String> {
        if self.git.checkout(workspace, &self.trunk).await.is_ok() {
            return None;
        }
        tracing::debug!(workspace = %workspace.display(), trunk = %self.trunk, "No local trunk, fetching it");
        match self.git.reset_to_remote(workspace, &self.trunk).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(workspace = %workspace.display(), trunk = %self.trunk, "Failed to check out trunk: {}", e);
                Some(format!("failed to check out {}: {e}", self.trunk))
            }
        }
    }
}
