//! Shared helpers for the HTTP pipeline tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::routing::post;
use axum::Router;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use tollgate::http::{build_router, AdmissionState, BypassRules, ORG_ID_HEADER};
use tollgate::ratelimit::{
    AdmissionEngine, CounterStore, ManualClock, MemoryCounterStore, Policy, Quota, StoreError,
};

/// A memory store that can be switched off to simulate an outage.
pub struct ToggleStore {
    inner: MemoryCounterStore,
    down: AtomicBool,
}

impl ToggleStore {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            inner: MemoryCounterStore::with_clock(Arc::new(clock)),
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for ToggleStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn set_expiry_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.set_expiry_if_absent(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.check()?;
        self.inner.ttl(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// A gateway under test.
pub struct TestGateway {
    pub app: Router,
    pub clock: ManualClock,
    pub store: Arc<ToggleStore>,
    pub state: AdmissionState,
}

impl TestGateway {
    /// Gateway with `limit` requests per 60 second window, clock at a window start.
    pub fn new(limit: u64) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let store = Arc::new(ToggleStore::new(clock.clone()));
        let policy = Policy::new(Quota::new(limit, Duration::from_secs(60)).unwrap());
        let engine = AdmissionEngine::new(store.clone(), policy).with_clock(Arc::new(clock.clone()));
        let bypass = BypassRules::new(["/health", "/readyz", "/metrics"], ["/internal/"]);
        let state = AdmissionState::new(Arc::new(engine), bypass).unwrap();

        let routes = Router::new().route("/v1/chat", post(|| async { "completion" }));
        let app = build_router(state.clone(), routes);

        Self {
            app,
            clock,
            store,
            state,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get_as(&self, path: &str, org: &str) -> Response<Body> {
        let request = Request::builder()
            .uri(path)
            .header(ORG_ID_HEADER, org)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn get_anonymous(&self, path: &str) -> Response<Body> {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        self.send(request).await
    }
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
