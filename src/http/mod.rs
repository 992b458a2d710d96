//! HTTP surface: middleware pipeline, admission control and server.

mod admission;
mod bypass;
mod identity;
mod metrics;
mod server;

pub use admission::{
    admission_control, apply_headers, AdmissionOutcome, AdmissionRejection, AdmissionState,
    RejectionBody, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER,
};
pub use bypass::BypassRules;
pub use identity::{
    request_context, resolve_identity, OrgIdentity, RequestId, ORG_ID_HEADER, ORG_TIER_HEADER,
    REQUEST_ID_HEADER, USER_ID_HEADER,
};
pub use metrics::{AdmissionStats, StatsSnapshot};
pub use server::{build_router, HttpServer};
