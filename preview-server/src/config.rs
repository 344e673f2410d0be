//! Runtime configuration for the orchestrator.
//!
//! Built once from CLI flags / environment in `main` and shared read-only by
//! every component afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Placeholder substituted with the allocated port in command templates
pub const PORT_PLACEHOLDER: &str = "{port}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("command template must not be empty")]
    EmptyCommand,
}

/// A whitespace-split argv template such as `npm run dev -- --port {port}`.
///
/// Commands are executed directly, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(Self { argv })
    }

    /// Render the argv, substituting `{port}` when a port is given.
    pub fn render(&self, port: Option<u16>) -> Vec<String> {
        match port {
            Some(port) => self
                .argv
                .iter()
                .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
                .collect(),
            None => self.argv.clone(),
        }
    }

    /// Render the argv followed by extra arguments (e.g. package names).
    pub fn render_with(&self, extra: &[String]) -> Vec<String> {
        let mut argv = self.argv.clone();
        argv.extend(extra.iter().cloned());
        argv
    }
}

impl FromStr for CommandTemplate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Previews are served at `<siteId>.<preview_domain>`
    pub preview_domain: String,
    /// Scheme used when rendering preview URLs for callers
    pub preview_scheme: String,
    pub workspaces_dir: PathBuf,
    /// Access token for the source host (clone credentials and PR API)
    pub github_token: Option<String>,
    pub github_api_url: String,
    /// Host name of the recognized source host
    pub source_host: String,
    pub trunk_branch: String,
    /// Subdomain labels that never route to a preview
    pub reserved_labels: Vec<String>,
    pub dev_command: CommandTemplate,
    pub install_command: CommandTemplate,
    pub package_install_command: CommandTemplate,
    /// Directory whose presence means dependencies are installed
    pub install_marker: String,
    pub install_timeout: Duration,
    pub readiness_timeout: Duration,
    pub first_preview_port: u16,
    /// `None` disables the idle reaper
    pub idle_timeout: Option<Duration>,
    pub git_author_name: String,
    pub git_author_email: String,
}

impl OrchestratorConfig {
    /// Defaults matching the CLI, rooted at the given workspaces directory.
    #[cfg(test)]
    pub fn for_workspaces(workspaces_dir: PathBuf) -> Self {
        Self {
            preview_domain: "preview.localhost".to_string(),
            preview_scheme: "https".to_string(),
            workspaces_dir,
            github_token: None,
            github_api_url: "https://api.github.com".to_string(),
            source_host: "github.com".to_string(),
            trunk_branch: "main".to_string(),
            reserved_labels: vec!["www".to_string(), "api".to_string()],
            dev_command: CommandTemplate {
                argv: ["npm", "run", "dev", "--", "--port", PORT_PLACEHOLDER]
                    .map(String::from)
                    .to_vec(),
            },
            install_command: CommandTemplate {
                argv: vec!["npm".to_string(), "install".to_string()],
            },
            package_install_command: CommandTemplate {
                argv: vec!["npm".to_string(), "install".to_string()],
            },
            install_marker: "node_modules".to_string(),
            install_timeout: crate::defaults::DEFAULT_INSTALL_TIMEOUT,
            readiness_timeout: crate::defaults::DEFAULT_READINESS_TIMEOUT,
            first_preview_port: crate::defaults::DEFAULT_FIRST_PREVIEW_PORT,
            idle_timeout: None,
            git_author_name: "Preview Orchestrator".to_string(),
            git_author_email: "preview@localhost".to_string(),
        }
    }

    pub fn preview_url(&self, site_id: &str) -> String {
        format!(
            "{}://{}.{}",
            self.preview_scheme, site_id, self.preview_domain
        )
    }

    pub fn workspace_path(&self, site_id: &str) -> PathBuf {
        crate::paths::workspace_dir(&self.workspaces_dir, site_id)
    }

    pub fn workspaces_root(&self) -> &Path {
        &self.workspaces_dir
    }

    pub fn has_token(&self) -> bool {
        self.github_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}
