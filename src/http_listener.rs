//! HTTP Listener (§4.8): serves ACME HTTP-01 challenges and redirects
//! everything else to HTTPS.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};

use crate::tls::TlsMaterializer;

const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub async fn serve(addr: SocketAddr, tls: Arc<TlsMaterializer>) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let tls = Arc::clone(&tls);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let tls = Arc::clone(&tls);
                async move { Ok::<_, Infallible>(handle(req, tls).await) }
            }))
        }
    });
    tracing::info!(%addr, "HTTP listener starting");
    Server::bind(&addr).serve(make_svc).await
}

async fn handle(req: Request<Body>, tls: Arc<TlsMaterializer>) -> Response<Body> {
    if let Some(token) = req.uri().path().strip_prefix(CHALLENGE_PREFIX) {
        return match tls.challenge_response(token).await {
            Some(key_auth) => Response::new(Body::from(key_auth)),
            None => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .expect("static response is always valid"),
        };
    }
    redirect_to_https(&req)
}

fn redirect_to_https(req: &Request<Body>) -> Response<Body> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path_and_query}");
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .body(Body::empty())
        .expect("static response is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_preserves_host_path_and_query() {
        let req = Request::builder()
            .uri("/foo/bar?x=1")
            .header(hyper::header::HOST, "a.test")
            .body(Body::empty())
            .unwrap();
        let response = redirect_to_https(&req);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://a.test/foo/bar?x=1"
        );
    }
}
