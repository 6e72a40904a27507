//! Rate limit middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ratelimit::{Admission, AdmissionEngine, VisitorKey};

pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

const REJECTION_MESSAGE: &str = "Slow down!!";

/// Body of every rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub success: bool,
    pub message: String,
}

impl RejectionBody {
    fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

fn set_quota_headers(headers: &mut HeaderMap, admission: &Admission) {
    headers.insert(HEADER_REMAINING, HeaderValue::from(admission.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(admission.reset_millis()));
}

/// Admit or reject the request based on the caller's address.
///
/// Allowed requests are forwarded and both quota headers are added to the
/// response; denied requests get `429` with a JSON body.
pub async fn rate_limit(
    State(engine): State<Arc<AdmissionEngine>>,
    req: Request,
    next: Next,
) -> Response {
    let key = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => VisitorKey::from_ip(addr.ip()),
        None => {
            warn!("Request without a peer address");
            return (
                StatusCode::BAD_REQUEST,
                Json(RejectionBody::new("Unable to identify client address")),
            )
                .into_response();
        }
    };

    let admission = engine.admit(&key).await;

    let mut response = if admission.is_allowed() {
        next.run(req).await
    } else {
        debug!(key = %key, reset_at = admission.reset_at, "Rejecting rate limited request");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RejectionBody::new(REJECTION_MESSAGE)),
        )
            .into_response()
    };

    set_quota_headers(response.headers_mut(), &admission);
    response
}
