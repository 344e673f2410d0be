mod api;
mod config;
mod defaults;
mod deploy;
mod git;
mod github;
mod idle;
mod orchestrator;
mod packages;
mod patch;
mod paths;
mod proxy;
mod registry;
mod routing;
mod shell;
mod supervisor;
mod workspace;

use crate::config::{CommandTemplate, OrchestratorConfig};
use crate::idle::{IdleConfig, IdleMonitor};
use crate::orchestrator::Orchestrator;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Preview Server - per-site dev servers behind a subdomain proxy
#[derive(Parser)]
#[command(name = "preview-server")]
#[command(version)]
#[command(about = "Preview Server - per-site dev servers behind a subdomain proxy")]
pub struct Args {
    /// HTTP port for the API and the preview proxy
    #[arg(long, env = "PORT", default_value_t = defaults::DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// Domain whose single-label subdomains are routed to previews
    #[arg(long, env = "PREVIEW_DOMAIN", default_value = "preview.localhost")]
    pub preview_domain: String,

    /// Scheme used when building preview URLs
    #[arg(long, env = "PREVIEW_SCHEME", default_value = "https")]
    pub preview_scheme: String,

    /// Directory holding one working copy per site
    #[arg(long, env = "WORKSPACES_DIR")]
    pub workspaces_dir: Option<PathBuf>,

    /// Access token for cloning, pushing and opening pull requests
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// REST API base of the source host
    #[arg(long, env = "GITHUB_API_URL", default_value = "https://api.github.com")]
    pub github_api_url: String,

    /// Host whose https URLs receive the access token
    #[arg(long, env = "SOURCE_HOST", default_value = "github.com")]
    pub source_host: String,

    /// Branch merges and pull requests target
    #[arg(long, env = "TRUNK_BRANCH", default_value = "main")]
    pub trunk_branch: String,

    /// Subdomain labels that are never treated as sites
    #[arg(long, env = "RESERVED_LABELS", value_delimiter = ',', default_value = "www,api")]
    pub reserved_labels: Vec<String>,

    /// Dev server command; `{port}` is replaced with the allocated port
    #[arg(long, env = "DEV_COMMAND", default_value = "npm run dev -- --port {port}")]
    pub dev_command: CommandTemplate,

    /// Dependency install command run when the install marker is missing
    #[arg(long, env = "INSTALL_COMMAND", default_value = "npm install")]
    pub install_command: CommandTemplate,

    /// Command that package names are appended to for /preview/install
    #[arg(long, env = "PACKAGE_INSTALL_COMMAND", default_value = "npm install")]
    pub package_install_command: CommandTemplate,

    /// Directory whose presence means dependencies are installed
    #[arg(long, env = "INSTALL_MARKER", default_value = "node_modules")]
    pub install_marker: String,

    /// Upper bound for install steps, in seconds
    #[arg(long, env = "INSTALL_TIMEOUT_SECS", default_value_t = defaults::DEFAULT_INSTALL_TIMEOUT.as_secs())]
    pub install_timeout_secs: u64,

    /// How long to wait for a dev server to accept connections, in seconds
    #[arg(long, env = "READINESS_TIMEOUT_SECS", default_value_t = defaults::DEFAULT_READINESS_TIMEOUT.as_secs())]
    pub readiness_timeout_secs: u64,

    /// First port handed to a dev server
    #[arg(long, env = "FIRST_PREVIEW_PORT", default_value_t = defaults::DEFAULT_FIRST_PREVIEW_PORT)]
    pub first_preview_port: u16,

    /// Stop previews idle for this many seconds (0 disables)
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Author name for deploy commits
    #[arg(long, env = "GIT_AUTHOR_NAME", default_value = "Preview Orchestrator")]
    pub git_author_name: String,

    /// Author email for deploy commits
    #[arg(long, env = "GIT_AUTHOR_EMAIL", default_value = "preview@localhost")]
    pub git_author_email: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Args {
    fn into_config(self, workspaces_dir: PathBuf) -> OrchestratorConfig {
        OrchestratorConfig {
            preview_domain: self.preview_domain,
            preview_scheme: self.preview_scheme,
            workspaces_dir,
            github_token: self.github_token,
            github_api_url: self.github_api_url,
            source_host: self.source_host,
            trunk_branch: self.trunk_branch,
            reserved_labels: self
                .reserved_labels
                .into_iter()
                .map(|l| l.trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
            dev_command: self.dev_command,
            install_command: self.install_command,
            package_install_command: self.package_install_command,
            install_marker: self.install_marker,
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
            first_preview_port: self.first_preview_port,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            git_author_name: self.git_author_name,
            git_author_email: self.git_author_email,
        }
    }
}

fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_rustls_crypto_provider();

    let args = Args::parse();
    init_tracing(args.log_format);

    // Tokio runtime for dev server processes, API work and the idle reaper.
    // Pingora manages its own runtime(s) internally.
    let rt = tokio::runtime::Runtime::new()?;

    let exe = std::env::current_exe().ok();
    let workspaces_dir = args.workspaces_dir.clone().unwrap_or_else(|| {
        if cfg!(debug_assertions)
            && let Some(exe) = &exe
            && let Some(p) = crate::paths::debug_default_workspaces_dir_from_exe(exe)
        {
            return p;
        }
        PathBuf::from(defaults::DEFAULT_WORKSPACES_DIR)
    });

    let port = args.port;
    let config = args.into_config(workspaces_dir);
    std::fs::create_dir_all(config.workspaces_root())?;

    tracing::info!("Preview Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("HTTP port: {}", port);
    tracing::info!("Preview domain: {}", config.preview_domain);
    tracing::info!("Workspaces: {}", config.workspaces_root().display());
    tracing::info!("Dev command: {}", config.dev_command);
    if !config.has_token() {
        tracing::info!("No access token configured; pull requests must be opened manually");
    }

    let idle_timeout = config.idle_timeout;
    let orchestrator = Arc::new(Orchestrator::new(config)?);

    if let Some(timeout) = idle_timeout {
        tracing::info!("Idle timeout: {}s", timeout.as_secs());
        let monitor = IdleMonitor::new(IdleConfig::new(timeout), orchestrator.clone());
        rt.spawn(async move { monitor.run().await });
    }

    // Dev servers run in their own process groups and would outlive us.
    let shutdown_orchestrator = orchestrator.clone();
    rt.spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutting down, stopping dev servers");
        shutdown_orchestrator.stop_all();
    });

    tracing::info!("Starting HTTP proxy on port {}", port);
    let server = proxy::build_server(orchestrator, rt.handle().clone(), port)?;

    // Run the server (this blocks)
    server.run_forever();
}
