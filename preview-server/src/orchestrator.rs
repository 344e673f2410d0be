//! The orchestrator context: owns configuration, the registry and every
//! component, and implements the API operations on top of them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use preview_core::{
    ApplyRequest, ApplyResponse, DeployRequest, DeployResponse, HealthResponse, InstallRequest,
    InstallResponse, PreviewStatus, SiteRequest, StartRequest, StartResponse, StatusResponse,
    StopResponse,
};

use crate::config::OrchestratorConfig;
use crate::deploy::{DeployError, Deployer};
use crate::git::{GitCli, GitIdentity};
use crate::github::{GitHubClient, GitHubError};
use crate::packages::{self, PackageError};
use crate::patch::{self, PatchError};
use crate::registry::Registry;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::workspace::{WorkspaceError, WorkspaceManager};

const MAX_SITE_ID_LEN: usize = 63;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Package(PackageError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    GitHub(#[from] GitHubError),
}

impl OrchestratorError {
    pub fn status_code(&self) -> u16 {
        match self {
            OrchestratorError::BadRequest(_) => 400,
            _ => 500,
        }
    }
}

impl From<PackageError> for OrchestratorError {
    fn from(e: PackageError) -> Self {
        if e.is_caller_error() {
            OrchestratorError::BadRequest(e.to_string())
        } else {
            OrchestratorError::Package(e)
        }
    }
}

/// Validate a site identifier: it names a directory and a DNS label.
pub fn validate_site_id(site_id: &str) -> Result<(), OrchestratorError> {
    if site_id.is_empty() || site_id.len() > MAX_SITE_ID_LEN {
        return Err(OrchestratorError::BadRequest(format!(
            "siteId must be 1-{MAX_SITE_ID_LEN} characters"
        )));
    }
    if site_id.starts_with('-') {
        return Err(OrchestratorError::BadRequest(
            "siteId must not start with '-'".to_string(),
        ));
    }
    if !site_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(OrchestratorError::BadRequest(format!(
            "siteId '{site_id}' may only contain lowercase letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, OrchestratorError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(OrchestratorError::BadRequest(format!("Missing {name}"))),
    }
}

fn site_from(value: &Option<String>) -> Result<&str, OrchestratorError> {
    let site_id = required(value, "siteId")?;
    validate_site_id(site_id)?;
    Ok(site_id)
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<Registry>,
    supervisor: Supervisor,
    workspaces: WorkspaceManager,
    deployer: Deployer,
    git: GitCli,
    /// Per-site locks serializing workspace and process mutations
    site_locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let registry = Arc::new(Registry::new(config.first_preview_port));
        let git = GitCli::new(GitIdentity {
            name: config.git_author_name.clone(),
            email: config.git_author_email.clone(),
        });
        let github = match config.github_token.as_ref() {
            Some(token) if config.has_token() => {
                Some(GitHubClient::new(&config.github_api_url, token.clone())?)
            }
            _ => None,
        };
        let supervisor = Supervisor::new(
            registry.clone(),
            config.dev_command.clone(),
            config.readiness_timeout,
        );
        let workspaces = WorkspaceManager::new(&config, git.clone());
        let deployer = Deployer::new(
            git.clone(),
            config.trunk_branch.clone(),
            config.source_host.clone(),
            github,
        );

        Ok(Self {
            config,
            registry,
            supervisor,
            workspaces,
            deployer,
            git,
            site_locks: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn site_lock(&self, site_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.site_locks.read().get(site_id) {
            return lock.clone();
        }
        self.site_locks
            .write()
            .entry(site_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ensure the workspace and a running dev server for a site.
    pub async fn start(&self, req: &StartRequest) -> Result<StartResponse, OrchestratorError> {
        let site_id = site_from(&req.site_id)?;
        let repo_url = required(&req.repo_url, "repoUrl")?;
        if repo_url.starts_with('-') {
            return Err(OrchestratorError::BadRequest(
                "repoUrl must not start with '-'".to_string(),
            ));
        }
        let branch = req
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.config.trunk_branch);

        let lock = self.site_lock(site_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.get(site_id)
            && existing.state.is_running()
        {
            self.registry.touch(site_id);
            return Ok(StartResponse {
                ok: true,
                preview_url: self.config.preview_url(site_id),
                status: PreviewStatus::Running,
                port: existing.port,
                warnings: Vec::new(),
            });
        }

        let path = self.config.workspace_path(site_id);
        let outcome = self.workspaces.ensure(&path, repo_url, branch).await?;
        tracing::info!(
            site = %site_id,
            cloned = outcome.cloned,
            installed = outcome.installed,
            "Workspace ready"
        );

        let started = self.supervisor.start(site_id, &path).await?;
        Ok(StartResponse {
            ok: true,
            preview_url: self.config.preview_url(site_id),
            status: PreviewStatus::Running,
            port: started.port,
            warnings: started.warnings,
        })
    }

    /// Apply a unified diff to a running preview, restarting when required.
    pub async fn apply(&self, req: &ApplyRequest) -> Result<ApplyResponse, OrchestratorError> {
        let site_id = site_from(&req.site_id)?;
        required(&req.unified_diff, "unifiedDiff")?;
        let diff = req.unified_diff.as_deref().unwrap_or_default();

        let lock = self.site_lock(site_id);
        let _guard = lock.lock().await;
        self.require_running(site_id)?;

        let path = self.config.workspace_path(site_id);
        let outcome = patch::apply_diff(&self.git, &path, diff).await?;
        self.registry.touch(site_id);

        let mut warnings = outcome.warnings;
        let port = if outcome.needs_restart {
            Some(self.restart(site_id, &mut warnings).await?)
        } else {
            None
        };

        Ok(ApplyResponse {
            ok: true,
            files_changed: outcome.files_changed,
            needs_restart: outcome.needs_restart,
            strategy: outcome.strategy,
            port,
            warnings,
        })
    }

    /// Lock-free snapshot of a site's preview.
    pub fn status(&self, req: &SiteRequest) -> Result<StatusResponse, OrchestratorError> {
        let site_id = site_from(&req.site_id)?;
        let Some(snapshot) = self.registry.get(site_id) else {
            return Ok(StatusResponse {
                ok: true,
                status: PreviewStatus::NotFound,
                preview_url: None,
                port: None,
                pid: None,
                last_activity: None,
                exit_code: None,
            });
        };

        let status = snapshot.status();
        Ok(StatusResponse {
            ok: true,
            status,
            preview_url: (status == PreviewStatus::Running).then(|| self.config.preview_url(site_id)),
            port: Some(snapshot.port),
            pid: snapshot.pid(),
            last_activity: Some(snapshot.last_activity),
            exit_code: snapshot.exit_code(),
        })
    }

    /// Install packages and/or a preset into a running preview, then restart it.
    pub async fn install(&self, req: &InstallRequest) -> Result<InstallResponse, OrchestratorError> {
        let site_id = site_from(&req.site_id)?;

        let lock = self.site_lock(site_id);
        let _guard = lock.lock().await;
        self.require_running(site_id)?;

        let requested = req.packages.clone().unwrap_or_default();
        let plan = packages::plan(&requested, req.preset.as_deref())?;
        let path = self.config.workspace_path(site_id);
        let outcome = packages::install(
            &self.config.package_install_command,
            &path,
            &plan,
            self.config.install_timeout,
        )
        .await?;
        self.registry.touch(site_id);

        let mut warnings = Vec::new();
        let port = self.restart(site_id, &mut warnings).await?;

        Ok(InstallResponse {
            ok: true,
            installed: outcome.installed,
            configs_created: outcome.configs_created,
            preset: plan.preset.map(|p| p.name.to_string()),
            port: Some(port),
            warnings,
        })
    }

    /// Stop a site's dev server. Unknown sites are reported as stopped.
    pub async fn stop(&self, req: &SiteRequest) -> Result<StopResponse, OrchestratorError> {
        let site_id = site_from(&req.site_id)?;

        let lock = self.site_lock(site_id);
        let _guard = lock.lock().await;
        let warnings = self.supervisor.stop(site_id);

        Ok(StopResponse {
            ok: true,
            status: PreviewStatus::Stopped,
            warnings,
        })
    }

    /// Commit the workspace and promote it as a merge or pull request.
    pub async fn deploy(&self, req: &DeployRequest) -> Result<DeployResponse, OrchestratorError> {
        let site_id = site_from(&req.site_id)?;
        let mode = req.mode.unwrap_or_default();

        let lock = self.site_lock(site_id);
        let _guard = lock.lock().await;

        let path = self.config.workspace_path(site_id);
        if !path.join(".git").exists() {
            return Err(OrchestratorError::BadRequest(format!(
                "No workspace for site '{site_id}'. Call /preview/start first."
            )));
        }

        let outcome = self
            .deployer
            .deploy(&path, mode, req.title.as_deref(), req.body.as_deref())
            .await?;
        self.registry.touch(site_id);

        Ok(DeployResponse {
            ok: true,
            mode,
            pr_url: outcome.pr_url,
            message: outcome.message,
            branch: outcome.branch,
            warnings: outcome.warnings,
        })
    }

    pub fn health(&self) -> HealthResponse {
        let (active, total) = self.registry.counts();
        HealthResponse {
            ok: true,
            active_previews: active,
            total_previews: total,
        }
    }

    /// Upstream address for proxied traffic, bumping activity.
    ///
    /// `None` unless the site is running.
    pub fn upstream_for(&self, site_id: &str) -> Option<SocketAddr> {
        let snapshot = self.registry.get(site_id)?;
        if !snapshot.state.is_running() {
            return None;
        }
        self.registry.touch(site_id);
        Some(snapshot.upstream)
    }

    /// Stop a site if it is still idle once its lock is held.
    pub async fn stop_if_idle(&self, site_id: &str, timeout: Duration) -> bool {
        let lock = self.site_lock(site_id);
        let _guard = lock.lock().await;
        let still_idle = self
            .registry
            .idle_sites(Utc::now(), timeout)
            .iter()
            .any(|s| s == site_id);
        if !still_idle {
            return false;
        }
        tracing::info!(site = %site_id, idle_secs = timeout.as_secs(), "Stopping idle preview");
        for warning in self.supervisor.stop(site_id) {
            tracing::warn!(site = %site_id, "{}", warning);
        }
        true
    }

    /// Signal every live dev server. Used on shutdown.
    pub fn stop_all(&self) {
        for site_id in self.registry.live_sites() {
            for warning in self.supervisor.stop(&site_id) {
                tracing::warn!(site = %site_id, "{}", warning);
            }
        }
    }

    fn require_running(&self, site_id: &str) -> Result<(), OrchestratorError> {
        match self.registry.get(site_id) {
            Some(snapshot) if snapshot.state.is_running() => Ok(()),
            _ => Err(OrchestratorError::BadRequest(
                "Preview not running. Call /preview/start first.".to_string(),
            )),
        }
    }

    async fn restart(&self, site_id: &str, warnings: &mut Vec<String>) -> Result<u16, OrchestratorError> {
        tracing::info!(site = %site_id, "Restarting dev server");
        warnings.extend(self.supervisor.stop(site_id));
        let path = self.config.workspace_path(site_id);
        let started = self.supervisor.start(site_id, &path).await?;
        warnings.extend(started.warnings);
        Ok(started.port)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::CommandTemplate;
    use crate::git::tests::{git_ok, init_origin};
    use crate::supervisor::tests::{pick_free_port, wait_until};
    use preview_core::DeployMode;
    use std::path::Path;
    use tempfile::TempDir;

    pub(crate) const APP_DIFF: &str = "--- a/src/App.tsx\n+++ b/src/App.tsx\n@@ -1 +1 @@\n-hello\n+goodbye\n";
    pub(crate) const PACKAGE_DIFF: &str =
        "--- a/package.json\n+++ b/package.json\n@@ -1 +1 @@\n-{}\n+{\"name\":\"site\"}\n";

    /// Orchestrator whose dev server is a plain `sleep`, accepted after a
    /// short readiness timeout.
    pub(crate) fn test_orchestrator(root: &Path) -> Orchestrator {
        let mut config = OrchestratorConfig::for_workspaces(root.join("workspaces"));
        config.dev_command = CommandTemplate::parse("sleep 30").unwrap();
        config.install_command = CommandTemplate::parse("true").unwrap();
        config.package_install_command = CommandTemplate::parse("true").unwrap();
        config.readiness_timeout = Duration::from_millis(300);
        config.first_preview_port = pick_free_port();
        config.git_author_name = "Test".to_string();
        config.git_author_email = "test@test.com".to_string();
        Orchestrator::new(config).unwrap()
    }

    fn start_req(site: &str, repo: &str) -> StartRequest {
        StartRequest {
            site_id: Some(site.to_string()),
            repo_url: Some(repo.to_string()),
            branch: None,
        }
    }

    fn site(site: &str) -> SiteRequest {
        SiteRequest {
            site_id: Some(site.to_string()),
        }
    }

    fn apply_req(site: &str, diff: &str) -> ApplyRequest {
        ApplyRequest {
            site_id: Some(site.to_string()),
            unified_diff: Some(diff.to_string()),
        }
    }

    fn origin(temp: &TempDir) -> String {
        init_origin(
            temp.path(),
            &[("src/App.tsx", "hello\n"), ("package.json", "{}\n")],
        )
    }

    #[test]
    fn site_id_validation() {
        let longest = "a".repeat(63);
        let too_long = "a".repeat(64);
        for ok in ["acme", "a", "my-site_2", longest.as_str()] {
            assert!(validate_site_id(ok).is_ok(), "{ok}");
        }
        for bad in ["", "-acme", "Acme", "a.b", "../etc", "a b", too_long.as_str()] {
            let err = validate_site_id(bad).unwrap_err();
            assert_eq!(err.status_code(), 400, "{bad}");
        }
    }

    #[tokio::test]
    async fn start_requires_fields() {
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());

        let err = orch.start(&StartRequest::default()).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "Missing siteId");

        let err = orch
            .start(&StartRequest {
                site_id: Some("acme".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing repoUrl");
    }

    #[tokio::test]
    async fn start_rejects_option_like_repo_url() {
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());

        let err = orch
            .start(&start_req("acme", "--upload-pack=touch /tmp/x"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(orch.registry.get("acme").is_none());
        assert!(!orch.config.workspace_path("acme").exists());
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let repo = origin(&temp);

        let first = orch.start(&start_req("acme", &repo)).await.unwrap();
        assert_eq!(first.status, PreviewStatus::Running);
        assert_eq!(first.preview_url, "https://acme.preview.localhost");
        let before = orch.registry.get("acme").unwrap();

        let second = orch.start(&start_req("acme", &repo)).await.unwrap();
        assert_eq!(second.port, first.port);
        let after = orch.registry.get("acme").unwrap();
        assert_eq!(after.pid(), before.pid());
        assert!(after.last_activity >= before.last_activity);

        orch.stop_all();
    }

    #[tokio::test]
    async fn ports_are_unique_and_increasing_across_sites() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let repo = origin(&temp);

        let mut ports = Vec::new();
        for name in ["one", "two", "three"] {
            ports.push(orch.start(&start_req(name, &repo)).await.unwrap().port);
        }
        assert!(ports.windows(2).all(|w| w[0] < w[1]), "{ports:?}");
        assert_eq!(orch.health().active_previews, 3);

        orch.stop_all();
    }

    #[tokio::test]
    async fn apply_requires_running_preview() {
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let err = orch.apply(&apply_req("acme", APP_DIFF)).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn apply_source_change_keeps_server() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let started = orch.start(&start_req("acme", &origin(&temp))).await.unwrap();

        let applied = orch.apply(&apply_req("acme", APP_DIFF)).await.unwrap();
        assert_eq!(applied.files_changed, vec!["src/App.tsx"]);
        assert!(!applied.needs_restart);
        assert_eq!(applied.port, None);
        assert_eq!(orch.registry.get("acme").unwrap().port, started.port);

        let ws = orch.config.workspace_path("acme");
        assert_eq!(
            std::fs::read_to_string(ws.join("src/App.tsx")).unwrap(),
            "goodbye\n"
        );
        orch.stop_all();
    }

    #[tokio::test]
    async fn apply_manifest_change_restarts_on_new_port() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let started = orch.start(&start_req("acme", &origin(&temp))).await.unwrap();

        let applied = orch.apply(&apply_req("acme", PACKAGE_DIFF)).await.unwrap();
        assert!(applied.needs_restart);
        let new_port = applied.port.unwrap();
        assert!(new_port > started.port);
        let snapshot = orch.registry.get("acme").unwrap();
        assert_eq!(snapshot.port, new_port);
        assert_eq!(snapshot.status(), PreviewStatus::Running);
        orch.stop_all();
    }

    #[tokio::test]
    async fn apply_that_fails_everywhere_still_reports_files() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        orch.start(&start_req("acme", &origin(&temp))).await.unwrap();

        let diff = "--- a/src/App.tsx\n+++ b/src/App.tsx\n@@ -1 +1 @@\n-nope\n+x\n";
        let applied = orch.apply(&apply_req("acme", diff)).await.unwrap();
        assert!(applied.ok);
        assert_eq!(applied.files_changed, vec!["src/App.tsx"]);
        assert_eq!(applied.strategy, None);
        assert!(!applied.warnings.is_empty());
        orch.stop_all();
    }

    #[tokio::test]
    async fn status_lifecycle() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());

        let missing = orch.status(&site("acme")).unwrap();
        assert_eq!(missing.status, PreviewStatus::NotFound);
        assert_eq!(missing.preview_url, None);

        let started = orch.start(&start_req("acme", &origin(&temp))).await.unwrap();
        let running = orch.status(&site("acme")).unwrap();
        assert_eq!(running.status, PreviewStatus::Running);
        assert_eq!(running.port, Some(started.port));
        assert!(running.pid.is_some());
        assert!(running.preview_url.is_some());
        assert!(running.last_activity.is_some());

        let stopped = orch.stop(&site("acme")).await.unwrap();
        assert_eq!(stopped.status, PreviewStatus::Stopped);
        let after = orch.status(&site("acme")).unwrap();
        assert_eq!(after.status, PreviewStatus::Stopped);
        assert_eq!(after.preview_url, None);
        assert_eq!(after.port, Some(started.port));
        assert_eq!(orch.health().active_previews, 0);
        assert_eq!(orch.health().total_previews, 1);
    }

    #[tokio::test]
    async fn restart_after_stop_uses_new_port() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let repo = origin(&temp);

        let first = orch.start(&start_req("acme", &repo)).await.unwrap();
        orch.stop(&site("acme")).await.unwrap();
        let second = orch.start(&start_req("acme", &repo)).await.unwrap();
        assert!(second.port > first.port);
        orch.stop_all();
    }

    #[tokio::test]
    async fn stop_unknown_site_is_ok() {
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let stopped = orch.stop(&site("ghost")).await.unwrap();
        assert!(stopped.ok);
        assert_eq!(stopped.status, PreviewStatus::Stopped);
    }

    #[tokio::test]
    async fn process_exit_flips_status_to_stopped() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        orch.start(&start_req("acme", &origin(&temp))).await.unwrap();
        let pid = orch.status(&site("acme")).unwrap().pid.unwrap();

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let flipped = wait_until(Duration::from_secs(5), || {
            orch.status(&site("acme")).map(|s| s.status).ok() == Some(PreviewStatus::Stopped)
        })
        .await;
        assert!(flipped);
        assert!(orch.upstream_for("acme").is_none());
    }

    #[tokio::test]
    async fn install_preset_seeds_configs_and_restarts() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let started = orch.start(&start_req("acme", &origin(&temp))).await.unwrap();

        let installed = orch
            .install(&InstallRequest {
                site_id: Some("acme".to_string()),
                packages: Some(vec!["lodash".to_string()]),
                preset: Some("tailwind".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(installed.preset.as_deref(), Some("tailwind"));
        assert!(installed.installed.contains(&"lodash".to_string()));
        assert_eq!(
            installed.configs_created,
            vec!["tailwind.config.js", "postcss.config.js"]
        );
        assert!(installed.port.unwrap() > started.port);
        orch.stop_all();
    }

    #[tokio::test]
    async fn install_rejects_bad_requests() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());

        let not_running = orch
            .install(&InstallRequest {
                site_id: Some("acme".to_string()),
                packages: Some(vec!["lodash".to_string()]),
                preset: None,
            })
            .await
            .unwrap_err();
        assert_eq!(not_running.status_code(), 400);

        orch.start(&start_req("acme", &origin(&temp))).await.unwrap();
        for req in [
            InstallRequest {
                site_id: Some("acme".to_string()),
                ..Default::default()
            },
            InstallRequest {
                site_id: Some("acme".to_string()),
                preset: Some("unknown".to_string()),
                ..Default::default()
            },
            InstallRequest {
                site_id: Some("acme".to_string()),
                packages: Some(vec!["--global".to_string()]),
                ..Default::default()
            },
        ] {
            let err = orch.install(&req).await.unwrap_err();
            assert_eq!(err.status_code(), 400, "{err}");
        }
        orch.stop_all();
    }

    #[tokio::test]
    async fn deploy_without_workspace_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        let err = orch
            .deploy(&DeployRequest {
                site_id: Some("acme".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn deploy_merge_pushes_applied_changes() {
        if !git_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let orch = test_orchestrator(temp.path());
        orch.start(&start_req("acme", &origin(&temp))).await.unwrap();
        orch.apply(&apply_req("acme", APP_DIFF)).await.unwrap();

        let deployed = orch
            .deploy(&DeployRequest {
                site_id: Some("acme".to_string()),
                mode: Some(DeployMode::Merge),
                title: Some("Update greeting".to_string()),
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(deployed.mode, DeployMode::Merge);
        assert_eq!(deployed.branch, None);
        assert_eq!(deployed.pr_url, None);

        let log = std::process::Command::new("git")
            .arg("--git-dir")
            .arg(temp.path().join("origin.git"))
            .args(["log", "-1", "--format=%s", "main"])
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&log.stdout).trim(), "Update greeting");
        orch.stop_all();
    }
}
