//! Request identity and per-request context.
//!
//! Authentication happens upstream of this service. The authenticator is
//! expected to inject the caller's organization (and optionally user and
//! tier) as headers; this module lifts them into request extensions where
//! admission control reads them. Admission control never derives identity
//! on its own.

use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use uuid::Uuid;

/// Header carrying the caller's organization id.
pub const ORG_ID_HEADER: &str = "x-organization-id";
/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the caller's organization tier.
pub const ORG_TIER_HEADER: &str = "x-organization-tier";
/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The resolved caller of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrgIdentity {
    /// Stable organization id; the partition key for admission state
    pub org_id: String,
    /// The user within the organization, if known
    pub user_id: Option<String>,
    /// The organization's tier, if known
    pub tier: Option<String>,
}

impl OrgIdentity {
    /// Identity for an organization with no user or tier.
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: None,
            tier: None,
        }
    }

    /// Read identity headers. Returns `None` when no organization is present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let org_id = header_str(headers, ORG_ID_HEADER)?;
        Some(Self {
            org_id,
            user_id: header_str(headers, USER_ID_HEADER),
            tier: header_str(headers, ORG_TIER_HEADER),
        })
    }
}

/// Correlation id for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Attach an `OrgIdentity` to the request when the upstream authenticator
/// supplied one.
pub async fn resolve_identity(mut req: Request, next: Next) -> Response {
    if let Some(identity) = OrgIdentity::from_headers(req.headers()) {
        req.extensions_mut().insert(identity);
    }
    next.run(req).await
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Assign a request id, echo it on the response, and log completion.
pub async fn request_context(mut req: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = header_str(req.headers(), REQUEST_ID_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    req.extensions_mut().insert(RequestId(request_id.clone()));

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "Incoming request"
    );

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = millis(start.elapsed()),
        "Request completed"
    );

    response
}
