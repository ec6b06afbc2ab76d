//! Request Router (§4.6): resolves an inbound request's host to a running
//! backend and proxies it end-to-end, including websocket upgrades.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderValue, HOST, TRANSFER_ENCODING};
use hyper::{Body, Request, Response, StatusCode};
use hyper_tungstenite::HyperWebsocket;
use tokio::net::UnixStream;

use crate::error::CoreError;
use crate::meta::{DomainCollection, Project, ProjectCollection, ProjectStatus};
use crate::supervisor::Supervisor;
use crate::unix_http;

const HEADER_X_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_X_FORWARDED_HOST: &str = "x-forwarded-host";
const HEADER_X_FORWARDED_PROTO: &str = "x-forwarded-proto";

pub struct Router {
    domains: Arc<DomainCollection>,
    projects: Arc<ProjectCollection>,
    supervisor: Arc<Supervisor>,
}

/// Why resolution or proxying failed, carrying the exact status code §4.6
/// assigns to each case. `Upstream` routes through the shared `CoreError`
/// taxonomy (`UpstreamUnavailable`, 502) instead of inventing its own.
enum RouteFailure {
    NoDomain,
    NoProject,
    NoHandle,
    Upstream(CoreError),
}

impl RouteFailure {
    fn status(&self) -> StatusCode {
        match self {
            RouteFailure::NoDomain => StatusCode::NOT_FOUND,
            RouteFailure::NoProject => StatusCode::BAD_GATEWAY,
            RouteFailure::NoHandle => StatusCode::SERVICE_UNAVAILABLE,
            RouteFailure::Upstream(e) => StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }
}

struct Resolved {
    #[allow(dead_code)]
    project: Project,
    socket_path: PathBuf,
}

impl Router {
    pub fn new(
        domains: Arc<DomainCollection>,
        projects: Arc<ProjectCollection>,
        supervisor: Arc<Supervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            domains,
            projects,
            supervisor,
        })
    }

    /// Entry point for both the HTTP and HTTPS listeners; `scheme` is the
    /// literal value forwarded as `X-Forwarded-Proto`.
    pub async fn route(
        self: Arc<Self>,
        mut req: Request<Body>,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> Response<Body> {
        let host = match host_of(&req) {
            Some(h) => h,
            None => return plain_status(StatusCode::BAD_REQUEST, "missing Host header"),
        };

        if hyper_tungstenite::is_upgrade_request(&req) {
            let resolved = match self.resolve(&host).await {
                Ok(r) => r,
                Err(failure) => return plain_status(failure.status(), "routing failed"),
            };
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            return match hyper_tungstenite::upgrade(&mut req, None) {
                Ok((response, websocket)) => {
                    tokio::spawn(relay_websocket(websocket, resolved.socket_path, path_and_query));
                    response
                }
                Err(err) => {
                    tracing::warn!(%err, "websocket upgrade handshake failed");
                    plain_status(StatusCode::BAD_REQUEST, "websocket upgrade failed")
                }
            };
        }

        let resolved = match self.resolve(&host).await {
            Ok(r) => r,
            Err(failure) => return plain_status(failure.status(), "routing failed"),
        };

        match self.proxy(req, &resolved.socket_path, remote_addr, &host, scheme).await {
            Ok(response) => response,
            Err(failure) => plain_status(failure.status(), "upstream request failed"),
        }
    }

    async fn resolve(&self, host: &str) -> Result<Resolved, RouteFailure> {
        let domain = self
            .domains
            .find_by_hostname(host)
            .ok_or(RouteFailure::NoDomain)?;
        let project = self
            .projects
            .get(&domain.project_id)
            .ok_or(RouteFailure::NoProject)?;
        if project.status != ProjectStatus::Running || !self.supervisor.is_running(&project.id).await
        {
            return Err(RouteFailure::NoHandle);
        }
        Ok(Resolved {
            socket_path: project.socket_path.clone(),
            project,
        })
    }

    async fn proxy(
        &self,
        req: Request<Body>,
        socket_path: &PathBuf,
        remote_addr: SocketAddr,
        host: &str,
        scheme: &'static str,
    ) -> Result<Response<Body>, RouteFailure> {
        let mut sender = unix_http::dial(socket_path)
            .await
            .map_err(|e| RouteFailure::Upstream(CoreError::UpstreamUnavailable(e.to_string())))?;

        let (mut parts, body) = req.into_parts();
        parts.headers.insert(
            HEADER_X_FORWARDED_FOR,
            header_value(&forwarded_for(&parts.headers, remote_addr)),
        );
        parts
            .headers
            .insert(HEADER_X_FORWARDED_HOST, header_value(host));
        parts
            .headers
            .insert(HEADER_X_FORWARDED_PROTO, header_value(scheme));
        let upstream_req = Request::from_parts(parts, body);

        let response = sender
            .send_request(upstream_req)
            .await
            .map_err(|e| RouteFailure::Upstream(CoreError::UpstreamUnavailable(e.to_string())))?;
        let (mut resp_parts, resp_body) = response.into_parts();
        resp_parts.headers.remove(TRANSFER_ENCODING);
        Ok(Response::from_parts(resp_parts, resp_body))
    }
}

fn host_of(req: &Request<Body>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())?;
    let without_port = raw.rsplit_once(':').map(|(h, _)| h).unwrap_or(raw);
    Some(without_port.to_ascii_lowercase())
}

fn forwarded_for(headers: &hyper::HeaderMap, remote_addr: SocketAddr) -> String {
    if let Some(existing) = headers
        .get(HEADER_X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(leftmost) = existing.split(',').next() {
            let trimmed = leftmost.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    remote_addr.ip().to_string()
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

fn plain_status(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .expect("static response is always valid")
}

async fn relay_websocket(websocket: HyperWebsocket, socket_path: PathBuf, path_and_query: String) {
    let client_ws = match websocket.await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::warn!(%err, "client websocket upgrade future failed");
            return;
        }
    };
    let backend_stream = match UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(%err, socket = %socket_path.display(), "failed to dial backend for websocket relay");
            return;
        }
    };
    let url = format!("ws://localhost{path_and_query}");
    let (backend_ws, _response) = match tokio_tungstenite::client_async(url, backend_stream).await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(%err, "backend websocket handshake failed");
            return;
        }
    };

    let (mut client_write, mut client_read) = client_ws.split();
    let (mut backend_write, mut backend_read) = backend_ws.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_read.next().await {
            if backend_write.send(msg).await.is_err() {
                break;
            }
        }
    };
    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_read.next().await {
            if client_write.send(msg).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderMap;

    #[test]
    fn host_of_strips_port_and_lowercases() {
        let req = Request::builder()
            .header(HOST, "A.Test:8443")
            .body(Body::empty())
            .unwrap();
        assert_eq!(host_of(&req).as_deref(), Some("a.test"));
    }

    #[test]
    fn host_of_missing_header_is_none() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(host_of(&req), None);
    }

    #[test]
    fn forwarded_for_prefers_leftmost_existing_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_X_FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(forwarded_for(&headers, remote), "203.0.113.9");
    }

    #[test]
    fn forwarded_for_falls_back_to_remote_addr() {
        let headers = HeaderMap::new();
        let remote: SocketAddr = "198.51.100.4:443".parse().unwrap();
        assert_eq!(forwarded_for(&headers, remote), "198.51.100.4");
    }

    #[test]
    fn route_failure_status_codes_match_spec() {
        assert_eq!(RouteFailure::NoDomain.status(), StatusCode::NOT_FOUND);
        assert_eq!(RouteFailure::NoProject.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(RouteFailure::NoHandle.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            RouteFailure::Upstream(CoreError::UpstreamUnavailable("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
