//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::rate_limit;
use crate::error::{GliderError, Result};
use crate::ratelimit::AdmissionEngine;

async fn hello() -> Json<Value> {
    Json(json!({ "message": "Hello Everyone!" }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the router. Everything except `/health` is rate limited.
pub fn router(engine: Arc<AdmissionEngine>) -> Router {
    Router::new()
        .route("/", get(hello))
        .layer(middleware::from_fn_with_state(engine, rate_limit))
        .route("/health", get(health))
}

/// HTTP server fronted by the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    engine: Arc<AdmissionEngine>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, engine: Arc<AdmissionEngine>) -> Self {
        Self { addr, engine }
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            router(self.engine).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GliderError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RejectionBody, HEADER_REMAINING, HEADER_RESET};
    use crate::ratelimit::{FailurePolicy, LimiterSettings, ManualClock, Micros};
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    const START: Micros = 1_700_000_000_000_000;

    fn engine(quota: u64) -> Arc<AdmissionEngine> {
        let settings = LimiterSettings {
            partition_key: "test".to_string(),
            quota,
            window: Duration::from_secs(60),
            flush_interval: Duration::from_millis(50),
            local_cache_capacity: 100,
            failure_policy: FailurePolicy::Open,
        };
        Arc::new(AdmissionEngine::new(
            settings,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(START)),
        ))
    }

    fn request(path: &str, peer: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            req.extensions_mut().insert(ConnectInfo(addr));
        }
        req
    }

    #[tokio::test]
    async fn test_allowed_request_carries_headers() {
        let app = router(engine(3));

        let response = app.oneshot(request("/", Some("1.2.3.4:5000"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[HEADER_REMAINING], "2");
        assert_eq!(
            response.headers()[HEADER_RESET],
            ((START + 60_000_000) / 1_000).to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_denied_request_gets_429() {
        let app = router(engine(1));

        let first = app
            .clone()
            .oneshot(request("/", Some("1.2.3.4:5000")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(request("/", Some("1.2.3.4:5001"))).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[HEADER_REMAINING], "0");

        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        let body: RejectionBody = serde_json::from_slice(&body).unwrap();
        assert!(!body.success);
        assert_eq!(body.message, "Slow down!!");
    }

    #[tokio::test]
    async fn test_missing_peer_address_is_bad_request() {
        let app = router(engine(3));
        let response = app.oneshot(request("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_is_not_limited() {
        let app = router(engine(1));
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request("/health", Some("1.2.3.4:5000")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(HEADER_REMAINING).is_none());
        }
    }
}
