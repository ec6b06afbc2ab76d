//! Small helpers for speaking HTTP/1.1 over a Unix domain socket — used by
//! both the health checker and the request router, which are otherwise the
//! only two places this process dials a backend.

use std::path::Path;
use std::time::Duration;

use hyper::client::conn::{self, SendRequest};
use hyper::Body;
use tokio::net::UnixStream;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("socket dial failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("http handshake failed: {0}")]
    Handshake(hyper::Error),
}

/// Connects to `socket_path` and performs the HTTP/1.1 client handshake,
/// returning a request sender. The connection's background driver task is
/// spawned and detached; it exits once the sender is dropped.
pub async fn dial(socket_path: &Path) -> Result<SendRequest<Body>, DialError> {
    let stream = UnixStream::connect(socket_path).await?;
    let (sender, connection) = conn::handshake(stream)
        .await
        .map_err(DialError::Handshake)?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "backend connection closed with error");
        }
    });
    Ok(sender)
}

/// Issues `GET /health` over `socket_path` and reports whether the backend
/// answered with a 2xx status within `timeout`.
pub async fn health_check(socket_path: &Path, timeout: Duration) -> bool {
    let probe = async {
        let mut sender = dial(socket_path).await.ok()?;
        let request = hyper::Request::builder()
            .method("GET")
            .uri("/health")
            .header("host", "localhost")
            .body(Body::empty())
            .ok()?;
        let response = sender.send_request(request).await.ok()?;
        Some(response.status().is_success())
    };
    matches!(tokio::time::timeout(timeout, probe).await, Ok(Some(true)))
}
