//! HTTP server assembly.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admission::{admission_control, AdmissionState};
use super::identity::{request_context, resolve_identity, OrgIdentity};
use crate::error::{GatewayError, Result};

/// HTTP server for the gateway.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission middleware state
    state: AdmissionState,
    /// Application routes placed behind admission control
    routes: Router,
}

impl HttpServer {
    /// Create a server with only the built-in routes.
    pub fn new(addr: SocketAddr, state: AdmissionState) -> Self {
        Self {
            addr,
            state,
            routes: Router::new(),
        }
    }

    /// Merge application routes into the admission-controlled pipeline.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Build the complete router with the middleware pipeline applied.
    pub fn router(&self) -> Router {
        build_router(self.state.clone(), self.routes.clone())
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have finished.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatewayError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GatewayError::Io(e)
            })
    }
}

/// Assemble routes and middleware.
///
/// Request order through the pipeline: request context, identity
/// resolution, admission control, route handler.
pub fn build_router(state: AdmissionState, routes: Router) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics))
        .route("/v1/whoami", get(whoami))
        .with_state(state.clone())
        .merge(routes)
        .layer(middleware::from_fn_with_state(state, admission_control))
        .layer(middleware::from_fn(resolve_identity))
        .layer(middleware::from_fn(request_context))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn readiness(State(state): State<AdmissionState>) -> Response {
    match state.engine().ping().await {
        Ok(()) => Json(json!({ "status": "ready" })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn metrics(State(state): State<AdmissionState>) -> Response {
    let stats = state.stats();
    match stats.render_prometheus() {
        Ok(body) => ([(header::CONTENT_TYPE, stats.content_type())], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn whoami(identity: Option<Extension<OrgIdentity>>) -> Response {
    match identity {
        Some(Extension(identity)) => Json(identity).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "unauthenticated",
                "message": "No organization identity on request",
            })),
        )
            .into_response(),
    }
}
