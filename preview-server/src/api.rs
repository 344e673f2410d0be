//! JSON API: (method, path, body) -> (status, JSON body)

use preview_core::{
    ApplyRequest, ApplyResponse, DeployRequest, DeployResponse, ErrorBody, InstallRequest,
    InstallResponse, SiteRequest, StartRequest, StartResponse, StatusResponse, StopResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::orchestrator::{Orchestrator, OrchestratorError};

const ROUTES: &[&str] = &[
    "/health",
    "/preview/start",
    "/preview/apply",
    "/preview/status",
    "/preview/install",
    "/preview/stop",
    "/preview/deploy",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, format!("failed to serialize response: {e}")),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let body = serde_json::to_string(&ErrorBody::new(message))
            .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
        Self { status, body }
    }
}

/// Route an API request to the orchestrator.
pub async fn dispatch(orch: &Orchestrator, method: &str, path: &str, body: &[u8]) -> ApiResponse {
    let route = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };

    match (method, route) {
        ("GET", "/health") => ApiResponse::json(200, &orch.health()),
        ("POST", "/preview/start") => respond(route, start(orch, body).await),
        ("POST", "/preview/apply") => respond(route, apply(orch, body).await),
        ("POST", "/preview/status") => respond(route, status(orch, body)),
        ("POST", "/preview/install") => respond(route, install(orch, body).await),
        ("POST", "/preview/stop") => respond(route, stop(orch, body).await),
        ("POST", "/preview/deploy") => respond(route, deploy(orch, body).await),
        (_, route) if ROUTES.contains(&route) => {
            ApiResponse::error(405, format!("Method {method} not allowed for {route}"))
        }
        _ => ApiResponse::error(404, format!("No route for {method} {path}")),
    }
}

fn parse<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, OrchestratorError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| OrchestratorError::BadRequest(format!("Invalid JSON body: {e}")))
}

fn respond<T: Serialize>(route: &str, result: Result<T, OrchestratorError>) -> ApiResponse {
    match result {
        Ok(value) => ApiResponse::json(200, &value),
        Err(e) => {
            let status = e.status_code();
            if status >= 500 {
                tracing::error!(route = route, "Request failed: {}", e);
            } else {
                tracing::debug!(route = route, status = status, "Rejected request: {}", e);
            }
            ApiResponse::error(status, e.to_string())
        }
    }
}

async fn start(orch: &Orchestrator, body: &[u8]) -> Result<StartResponse, OrchestratorError> {
    let req: StartRequest = parse(body)?;
    orch.start(&req).await
}

async fn apply(orch: &Orchestrator, body: &[u8]) -> Result<ApplyResponse, OrchestratorError> {
    let req: ApplyRequest = parse(body)?;
    orch.apply(&req).await
}

fn status(orch: &Orchestrator, body: &[u8]) -> Result<StatusResponse, OrchestratorError> {
    let req: SiteRequest = parse(body)?;
    orch.status(&req)
}

async fn install(orch: &Orchestrator, body: &[u8]) -> Result<InstallResponse, OrchestratorError> {
    let req: InstallRequest = parse(body)?;
    orch.install(&req).await
}

async fn stop(orch: &Orchestrator, body: &[u8]) -> Result<StopResponse, OrchestratorError> {
    let req: SiteRequest = parse(body)?;
    orch.stop(&req).await
}

async fn deploy(orch: &Orchestrator, body: &[u8]) -> Result<DeployResponse, OrchestratorError> {
    let req: DeployRequest = parse(body)?;
    orch.deploy(&req).await
}
