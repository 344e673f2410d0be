//! HTTP proxy using Pingora
//!
//! One listener serves two kinds of traffic, told apart by the Host header:
//! `<site>.<preview-domain>` is forwarded to that site's dev server (including
//! WebSocket upgrades), everything else is handled by the JSON API.

mod pages;

use pages::{bad_gateway, not_ready};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use pingora_core::ErrorSource;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{FailToProxy, ProxyHttp, Session};
use tokio::runtime::Handle;

use crate::api::{self, ApiResponse};
use crate::defaults;
use crate::orchestrator::Orchestrator;
use crate::routing::resolve_site;

/// Preview HTTP proxy service
pub struct PreviewProxy {
    orchestrator: Arc<Orchestrator>,
    /// Runtime that owns dev server processes and API work
    control: Handle,
}

impl PreviewProxy {
    pub fn new(orchestrator: Arc<Orchestrator>, control: Handle) -> Self {
        Self {
            orchestrator,
            control,
        }
    }

    async fn serve_api(&self, session: &mut Session) -> Result<ApiResponse> {
        let method = session.req_header().method.as_str().to_string();
        let path = session.req_header().uri.path().to_string();

        let Some(body) = read_body(session, defaults::MAX_API_BODY_BYTES).await? else {
            return Ok(ApiResponse::error(413, "Request body too large"));
        };

        // Child processes must outlive the proxy task that asked for them.
        let orchestrator = self.orchestrator.clone();
        let handle = self
            .control
            .spawn(async move { api::dispatch(&orchestrator, &method, &path, &body).await });
        Ok(match handle.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("API handler panicked or was cancelled: {}", e);
                ApiResponse::error(500, "internal error")
            }
        })
    }
}

/// Request context: which site the request is for and where it goes
#[derive(Default)]
pub struct RequestCtx {
    site: Option<String>,
    upstream: Option<SocketAddr>,
    host: String,
}

#[async_trait]
impl ProxyHttp for PreviewProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        ctx.host = request_host(session);
        let config = self.orchestrator.config();

        if let Some(site) = resolve_site(&ctx.host, &config.preview_domain, &config.reserved_labels) {
            let upstream = self.orchestrator.upstream_for(&site);
            ctx.site = Some(site.clone());
            match upstream {
                Some(addr) => {
                    ctx.upstream = Some(addr);
                    return Ok(false);
                }
                None => {
                    write_response(
                        session,
                        503,
                        "text/html; charset=utf-8",
                        not_ready(&site),
                        &[("Retry-After", "3")],
                    )
                    .await?;
                    return Ok(true);
                }
            }
        }

        let response = self.serve_api(session).await?;
        write_response(
            session,
            response.status,
            "application/json",
            response.body,
            &[],
        )
        .await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let addr = ctx
            .upstream
            .ok_or_else(|| Error::new(ErrorType::ConnectNoRoute))?;
        let peer = HttpPeer::new((addr.ip().to_string(), addr.port()), false, String::new());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(addr) = ctx.upstream else {
            return Ok(());
        };
        // Dev servers only trust their own loopback origin.
        let local = format!("localhost:{}", addr.port());
        if upstream_request.headers.contains_key("origin") {
            upstream_request.insert_header("Origin", format!("http://{local}"))?;
        }
        upstream_request.insert_header("Host", local)?;
        upstream_request.insert_header("X-Forwarded-Host", ctx.host.clone())?;
        upstream_request.insert_header(
            "X-Forwarded-Proto",
            self.orchestrator.config().preview_scheme.clone(),
        )?;
        Ok(())
    }

    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        let site = ctx.site.clone().unwrap_or_default();
        let code = match (e.etype(), e.esource()) {
            (ErrorType::HTTPStatus(code), _) => *code,
            // Client went away; nothing to answer
            (_, ErrorSource::Downstream) => 0,
            _ => 502,
        };

        if code > 0 {
            tracing::warn!(site = %site, upstream = ?ctx.upstream, "Proxying to dev server failed: {}", e);
            if let Err(write_err) = write_response(
                session,
                code,
                "text/html; charset=utf-8",
                bad_gateway(&site),
                &[],
            )
            .await
            {
                tracing::debug!(site = %site, "Failed to write error page: {}", write_err);
            }
        }

        FailToProxy {
            error_code: code,
            can_reuse_downstream: false,
        }
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        let path = session.req_header().uri.path();
        let method = session.req_header().method.as_str();

        tracing::info!(
            host = %ctx.host,
            method = method,
            path = path,
            status = status,
            site = ctx.site.as_deref().unwrap_or("-"),
            "Request completed"
        );
    }
}

fn request_host(session: &Session) -> String {
    let req = session.req_header();
    req.headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Read the full request body. `None` when it exceeds `limit` bytes.
async fn read_body(session: &mut Session, limit: usize) -> Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    while let Some(chunk) = session.read_request_body().await? {
        if body.len() + chunk.len() > limit {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

async fn write_response(
    session: &mut Session,
    status: u16,
    content_type: &str,
    body: String,
    extra_headers: &[(&'static str, &str)],
) -> Result<()> {
    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header("Content-Type", content_type.to_string())?;
    header.insert_header("Content-Length", body.len().to_string())?;
    header.insert_header("Cache-Control", "no-cache, no-store")?;
    for (name, value) in extra_headers {
        header.insert_header(*name, value.to_string())?;
    }
    session
        .write_response_header(Box::new(header), false)
        .await?;
    session.write_response_body(Some(body.into()), true).await?;
    Ok(())
}

/// Build the Pingora server with a single plain HTTP listener.
pub fn build_server(orchestrator: Arc<Orchestrator>, control: Handle, port: u16) -> Result<Server> {
    let mut server = Server::new(None)?;
    server.bootstrap();

    let proxy = PreviewProxy::new(orchestrator, control);
    let mut proxy_service = pingora_proxy::http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&format!("0.0.0.0:{port}"));

    server.add_service(proxy_service);
    Ok(server)
}
