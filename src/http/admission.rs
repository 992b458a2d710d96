//! Admission control middleware.
//!
//! Runs after identity resolution and before any route handler. Each request
//! ends in exactly one [`AdmissionOutcome`]:
//!
//! ```text
//! START -> BYPASSED
//!       -> UNAUTHENTICATED
//!       -> CHECKING -> ALLOWED | DENIED | FAIL_OPEN
//! ```
//!
//! A store failure lets the request through. Serving traffic without
//! fairness for the length of a store outage is preferred to refusing all
//! traffic; the failure is logged at error level for every affected request.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::bypass::BypassRules;
use super::identity::{OrgIdentity, RequestId};
use super::metrics::AdmissionStats;
use crate::ratelimit::{AdmissionEngine, Verdict};

/// Response header carrying the window limit.
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Response header carrying the admissions left in the window.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Response header carrying the reset instant (RFC 3339, UTC).
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Terminal state of admission control for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The path is exempt; the store was not consulted
    Bypassed,
    /// No organization identity; left to the authentication layer
    Unauthenticated,
    /// Within the organization's budget
    Allowed(Verdict),
    /// Over the organization's budget
    Denied(Verdict),
    /// The store failed; let through without admission headers
    FailOpen,
}

impl AdmissionOutcome {
    /// Short label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionOutcome::Bypassed => "bypassed",
            AdmissionOutcome::Unauthenticated => "unauthenticated",
            AdmissionOutcome::Allowed(_) => "allowed",
            AdmissionOutcome::Denied(_) => "denied",
            AdmissionOutcome::FailOpen => "fail_open",
        }
    }
}

/// Shared state for the admission middleware.
#[derive(Clone)]
pub struct AdmissionState {
    engine: Arc<AdmissionEngine>,
    bypass: Arc<BypassRules>,
    stats: Arc<AdmissionStats>,
}

impl AdmissionState {
    /// Create middleware state around an engine and its bypass rules.
    pub fn new(engine: Arc<AdmissionEngine>, bypass: BypassRules) -> crate::error::Result<Self> {
        Ok(Self {
            engine,
            bypass: Arc::new(bypass),
            stats: Arc::new(AdmissionStats::new()?),
        })
    }

    /// The admission engine.
    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    /// Outcome counters.
    pub fn stats(&self) -> &Arc<AdmissionStats> {
        &self.stats
    }

    /// Decide the outcome for a request to `path` from `identity`.
    pub async fn decide(
        &self,
        path: &str,
        identity: Option<&OrgIdentity>,
        request_id: &str,
    ) -> AdmissionOutcome {
        if self.bypass.is_exempt(path) {
            return AdmissionOutcome::Bypassed;
        }

        let Some(identity) = identity else {
            debug!(request_id = %request_id, path = %path, "No organization identity, deferring to auth");
            return AdmissionOutcome::Unauthenticated;
        };

        match self
            .engine
            .check_limit(&identity.org_id, identity.tier.as_deref())
            .await
        {
            Ok(verdict) if verdict.allowed => {
                debug!(
                    request_id = %request_id,
                    org_id = %identity.org_id,
                    path = %path,
                    remaining = verdict.remaining,
                    outcome = "allowed",
                    "Request admitted"
                );
                AdmissionOutcome::Allowed(verdict)
            }
            Ok(verdict) => {
                warn!(
                    request_id = %request_id,
                    org_id = %identity.org_id,
                    path = %path,
                    limit = verdict.limit,
                    reset_at = %format_reset(verdict.reset_at),
                    outcome = "denied",
                    "Request denied by admission control"
                );
                AdmissionOutcome::Denied(verdict)
            }
            Err(e) => {
                error!(
                    request_id = %request_id,
                    org_id = %identity.org_id,
                    path = %path,
                    error = %e,
                    outcome = "fail_open",
                    "Admission check failed, allowing request"
                );
                AdmissionOutcome::FailOpen
            }
        }
    }
}

/// Axum middleware applying admission control.
///
/// Install with `axum::middleware::from_fn_with_state`, inside the layer that
/// resolves identity.
pub async fn admission_control(
    State(state): State<AdmissionState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let identity = req.extensions().get::<OrgIdentity>().cloned();

    let outcome = state.decide(&path, identity.as_ref(), &request_id).await;
    state.stats.record(&outcome);

    match outcome {
        AdmissionOutcome::Bypassed
        | AdmissionOutcome::Unauthenticated
        | AdmissionOutcome::FailOpen => next.run(req).await,
        AdmissionOutcome::Allowed(verdict) => {
            let mut response = next.run(req).await;
            apply_headers(response.headers_mut(), &verdict);
            response
        }
        AdmissionOutcome::Denied(verdict) => {
            AdmissionRejection::new(verdict, state.engine.clock().now()).into_response()
        }
    }
}

/// Set the three admission headers from a verdict.
pub fn apply_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(verdict.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(verdict.remaining));
    if let Ok(value) = HeaderValue::from_str(&format_reset(verdict.reset_at)) {
        headers.insert(RESET_HEADER, value);
    }
}

fn format_reset(reset_at: DateTime<Utc>) -> String {
    reset_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// JSON body of a 429 response.
#[derive(Debug, Serialize)]
pub struct RejectionBody {
    pub error: &'static str,
    pub message: String,
    pub limit: u64,
    pub remaining: u64,
    #[serde(rename = "resetAt")]
    pub reset_at: String,
}

/// A request denied by admission control.
#[derive(Debug, Clone)]
pub struct AdmissionRejection {
    verdict: Verdict,
    retry_after: u64,
}

impl AdmissionRejection {
    /// Build a rejection for `verdict` as seen at `now`.
    pub fn new(verdict: Verdict, now: DateTime<Utc>) -> Self {
        let retry_after = verdict.retry_after_secs(now);
        Self {
            verdict,
            retry_after,
        }
    }

    fn body(&self) -> RejectionBody {
        let reset_at = format_reset(self.verdict.reset_at);
        RejectionBody {
            error: "rate_limit_exceeded",
            message: format!(
                "Organization request limit of {} per window reached. Retry after {}.",
                self.verdict.limit, reset_at
            ),
            limit: self.verdict.limit,
            remaining: self.verdict.remaining,
            reset_at,
        }
    }
}

impl IntoResponse for AdmissionRejection {
    fn into_response(self) -> Response {
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self.body())).into_response();
        let headers = response.headers_mut();
        apply_headers(headers, &self.verdict);
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(self.retry_after),
        );
        response
    }
}
