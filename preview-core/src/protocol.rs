//! Preview orchestrator API types
//!
//! Field names are camelCase on the wire. Request fields are optional so the
//! server can report exactly which required field is missing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a preview as reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    Starting,
    Running,
    Stopped,
    /// No record exists for the site
    NotFound,
}

impl std::fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewStatus::Starting => write!(f, "starting"),
            PreviewStatus::Running => write!(f, "running"),
            PreviewStatus::Stopped => write!(f, "stopped"),
            PreviewStatus::NotFound => write!(f, "not_found"),
        }
    }
}

/// How accepted changes are promoted back to the source repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Push a fresh branch and open a pull request against trunk
    #[default]
    Pr,
    /// Push straight to trunk
    Merge,
}

impl std::fmt::Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployMode::Pr => write!(f, "pr"),
            DeployMode::Merge => write!(f, "merge"),
        }
    }
}

/// Which patch strategy ended up applying a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStrategy {
    ThreeWay,
    Plain,
    LineBased,
}

impl std::fmt::Display for PatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchStrategy::ThreeWay => write!(f, "three_way"),
            PatchStrategy::Plain => write!(f, "plain"),
            PatchStrategy::LineBased => write!(f, "line_based"),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// `POST /preview/start`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub site_id: Option<String>,
    pub repo_url: Option<String>,
    /// Defaults to the trunk branch
    pub branch: Option<String>,
}

/// `POST /preview/apply`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub site_id: Option<String>,
    pub unified_diff: Option<String>,
}

/// `POST /preview/status` and `POST /preview/stop`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRequest {
    pub site_id: Option<String>,
}

/// `POST /preview/install`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub site_id: Option<String>,
    pub packages: Option<Vec<String>>,
    pub preset: Option<String>,
}

/// `POST /preview/deploy`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub site_id: Option<String>,
    pub mode: Option<DeployMode>,
    pub title: Option<String>,
    pub body: Option<String>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub ok: bool,
    pub preview_url: String,
    pub status: PreviewStatus,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResponse {
    pub ok: bool,
    pub files_changed: Vec<String>,
    pub needs_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<PatchStrategy>,
    /// Port of the restarted dev server, when a restart happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub ok: bool,
    pub status: PreviewStatus,
    /// Always present; `null` unless the preview is running
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub ok: bool,
    pub installed: Vec<String>,
    pub configs_created: Vec<String>,
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub ok: bool,
    pub status: PreviewStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub ok: bool,
    pub mode: DeployMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    /// Records that are starting or running
    pub active_previews: usize,
    pub total_previews: usize,
}

/// Body of every 4xx/5xx JSON response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
