//! Pull request client for the source host's REST API

use std::time::Duration;

use serde::Serialize;

const USER_AGENT: &str = concat!("preview-server/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("failed to build HTTP client: {0}")]
    Build(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: String) -> Result<Self, GitHubError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GitHubError::Build(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Open a pull request `head -> base`.
    ///
    /// Returns the PR's `html_url`, or `None` when the response body does not
    /// carry one.
    pub async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<Option<String>, GitHubError> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_base, owner, repo);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&CreatePullRequest {
                title,
                body,
                head,
                base,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(400).collect();
            return Err(GitHubError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let html_url = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("html_url").and_then(|u| u.as_str()).map(str::to_string));
        Ok(html_url)
    }
}
