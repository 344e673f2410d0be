//! Thin async wrapper around the `git` CLI.
//!
//! Every working-tree mutation (clone, reset, apply, commit, push) goes
//! through here so argument construction and error classification live in
//! one place.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("push rejected: {0}")]
    PushRejected(String),
    #[error("branch or reference not found: {0}")]
    InvalidReference(String),
}

/// Commit identity used for commits created on behalf of callers
#[derive(Debug, Clone)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct GitCli {
    identity: GitIdentity,
}

impl GitCli {
    pub fn new(identity: GitIdentity) -> Self {
        Self { identity }
    }

    /// Shallow, single-branch clone of `url` into `destination`.
    pub async fn clone_shallow(
        &self,
        url: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<(), GitError> {
        let args: Vec<OsString> = vec![
            "clone".into(),
            "--depth".into(),
            "1".into(),
            "--single-branch".into(),
            "--branch".into(),
            branch.into(),
            "--".into(),
            url.into(),
            destination.as_os_str().into(),
        ];
        let cwd = destination.parent().unwrap_or(destination);
        self.git_impl(cwd, args, true).await?;
        Ok(())
    }

    /// Fetch the tip of `branch` from origin and force the working copy onto it,
    /// discarding local modifications and untracked (non-ignored) files.
    pub async fn reset_to_remote(&self, repo_path: &Path, branch: &str) -> Result<(), GitError> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        self.git_network(repo_path, ["fetch", "--depth", "1", "origin", refspec.as_str()])
            .await?;
        let remote_ref = format!("origin/{branch}");
        self.git(repo_path, ["checkout", "--force", "-B", branch, remote_ref.as_str()])
            .await?;
        self.git(repo_path, ["reset", "--hard", remote_ref.as_str()])
            .await?;
        self.git(repo_path, ["clean", "-fd"]).await?;
        Ok(())
    }

    /// Run `git apply` with the given flags against a patch file.
    pub async fn apply(
        &self,
        repo_path: &Path,
        patch_file: &Path,
        flags: &[&str],
    ) -> Result<(), GitError> {
        let mut args: Vec<OsString> = vec!["apply".into()];
        args.extend(flags.iter().map(OsString::from));
        args.push(patch_file.as_os_str().into());
        self.git(repo_path, args).await?;
        Ok(())
    }

    pub async fn add_all(&self, repo_path: &Path) -> Result<(), GitError> {
        self.git(repo_path, ["add", "-A"]).await?;
        Ok(())
    }

    /// Commit staged changes with the configured identity.
    pub async fn commit(&self, repo_path: &Path, message: &str) -> Result<(), GitError> {
        let name = format!("user.name={}", self.identity.name);
        let email = format!("user.email={}", self.identity.email);
        self.git(
            repo_path,
            ["-c", name.as_str(), "-c", email.as_str(), "commit", "-m", message],
        )
        .await?;
        Ok(())
    }

    /// Push `refspec` to origin.
    pub async fn push(&self, repo_path: &Path, refspec: &str) -> Result<(), GitError> {
        self.git_network(repo_path, ["push", "origin", refspec])
            .await?;
        Ok(())
    }

    /// Push a new local branch to origin and track it.
    pub async fn push_branch(&self, repo_path: &Path, branch: &str) -> Result<(), GitError> {
        self.git_network(repo_path, ["push", "-u", "origin", branch])
            .await?;
        Ok(())
    }

    pub async fn set_remote_url(&self, repo_path: &Path, url: &str) -> Result<(), GitError> {
        self.git(repo_path, ["remote", "set-url", "origin", url]).await?;
        Ok(())
    }

    pub async fn checkout_new_branch(&self, repo_path: &Path, branch: &str) -> Result<(), GitError> {
        self.git(repo_path, ["checkout", "-b", branch]).await?;
        Ok(())
    }

    pub async fn checkout(&self, repo_path: &Path, branch: &str) -> Result<(), GitError> {
        self.git(repo_path, ["checkout", branch]).await?;
        Ok(())
    }

    pub async fn remote_url(&self, repo_path: &Path) -> Result<String, GitError> {
        let out = self.git(repo_path, ["remote", "get-url", "origin"]).await?;
        Ok(out.trim().to_string())
    }

    #[cfg(test)]
    pub async fn current_branch(&self, repo_path: &Path) -> Result<String, GitError> {
        let out = self
            .git(repo_path, ["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Run `git -C <repo_path> <args...>` and return stdout on success.
    pub async fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_impl(repo_path, args, false).await
    }

    async fn git_network<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_impl(repo_path, args, true).await
    }

    async fn git_impl<I, S>(&self, repo_path: &Path, args: I, network: bool) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args
            .into_iter()
            .map(|a| a.as_ref().to_os_string())
            .collect();
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(repo_path)
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::trace!(repo = ?repo_path, "Running git {}", describe_args(&args));

        let out = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::NotAvailable
            } else {
                GitError::CommandFailed(e.to_string())
            }
        })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let combined = match (stdout.is_empty(), stderr.is_empty()) {
                (true, true) => "Command failed with no output".to_string(),
                (false, false) => format!("--- stderr\n{stderr}\n--- stdout\n{stdout}"),
                (false, true) => format!("--- stdout\n{stdout}"),
                (true, false) => format!("--- stderr\n{stderr}"),
            };
            let combined = redact_credentials(&combined);
            if network {
                return Err(classify_cli_error(combined));
            }
            if combined.contains("invalid reference:")
                || combined.contains("not a valid ref")
                || combined.contains("unknown revision")
            {
                return Err(GitError::InvalidReference(combined));
            }
            return Err(GitError::CommandFailed(combined));
        }

        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

/// Render git arguments for logs with any URL credentials masked.
fn describe_args(args: &[OsString]) -> String {
    let joined = args
        .iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    redact_credentials(&joined)
}

fn classify_cli_error(msg: String) -> GitError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("invalid username or password")
    {
        GitError::AuthFailed(msg)
    } else if lower.contains("non-fast-forward")
        || lower.contains("failed to push some refs")
        || lower.contains("fetch first")
        || lower.contains("updates were rejected because the tip")
    {
        GitError::PushRejected(msg)
    } else if lower.contains("couldn't find remote ref") || lower.contains("not found in upstream")
    {
        GitError::InvalidReference(msg)
    } else {
        GitError::CommandFailed(msg)
    }
}

/// Embed an access token in the authority of an `https://` URL on `source_host`.
///
/// URLs for other hosts, non-https URLs and URLs that already carry
/// credentials are returned unchanged.
pub fn inject_credentials(url: &str, source_host: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return url.to_string();
    };
    let Some(rest) = url.strip_prefix("https://") else {
        return url.to_string();
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.contains('@') {
        return url.to_string();
    }
    let host = authority.split(':').next().unwrap_or(authority);
    if !host.eq_ignore_ascii_case(source_host) {
        return url.to_string();
    }
    format!("https://{token}@{rest}")
}

/// Replace the userinfo part of any `scheme://user@host` occurrence with `***`.
pub fn redact_credentials(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find("://") {
        let (head, tail) = rest.split_at(idx + 3);
        out.push_str(head);
        let end = tail
            .find(|c: char| c.is_whitespace() || c == '/' || c == '\'' || c == '"')
            .unwrap_or(tail.len());
        let authority = &tail[..end];
        match authority.rfind('@') {
            Some(at) => {
                out.push_str("***");
                out.push_str(&authority[at..]);
            }
            None => out.push_str(authority),
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

/// Extract `(owner, repo)` from a remote URL on `source_host`.
///
/// Handles `https://[token@]host/owner/repo(.git)` and `git@host:owner/repo(.git)`.
pub fn parse_remote_repo(url: &str, source_host: &str) -> Option<(String, String)> {
    let lower = url.to_ascii_lowercase();
    let host_lower = source_host.to_ascii_lowercase();
    let start = if let Some(idx) = lower.find(&format!("{host_lower}/")) {
        idx + host_lower.len() + 1
    } else if let Some(idx) = lower.find(&format!("{host_lower}:")) {
        idx + host_lower.len() + 1
    } else {
        return None;
    };

    let path = url[start..].trim_end_matches('/');
    let mut parts = path.split('/');
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.trim_end_matches(".git").to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}
