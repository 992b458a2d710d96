//! Admission counters exposed on `/metrics`.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use super::admission::AdmissionOutcome;
use crate::error::{GatewayError, Result};

const OUTCOMES: [&str; 5] = ["bypassed", "unauthenticated", "allowed", "denied", "fail_open"];

/// Running totals of admission outcomes for this process.
///
/// Counters live on a private registry rather than the global one, so every
/// gateway (and every test) scrapes only its own decisions.
#[derive(Clone)]
pub struct AdmissionStats {
    registry: Registry,
    decisions: IntCounterVec,
}

/// A point-in-time copy of [`AdmissionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub bypassed: u64,
    pub unauthenticated: u64,
    pub allowed: u64,
    pub denied: u64,
    pub fail_open: u64,
}

impl AdmissionStats {
    /// Create zeroed counters on a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let decisions = IntCounterVec::new(
            Opts::new("tollgate_admission_total", "Admission decisions by outcome."),
            &["outcome"],
        )?;
        registry.register(Box::new(decisions.clone()))?;

        // Export every outcome from the first scrape, even at zero
        for outcome in OUTCOMES {
            decisions.with_label_values(&[outcome]).inc_by(0);
        }

        Ok(Self {
            registry,
            decisions,
        })
    }

    /// Count one terminal outcome.
    pub fn record(&self, outcome: &AdmissionOutcome) {
        self.decisions.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Copy the current totals.
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |outcome: &str| self.decisions.with_label_values(&[outcome]).get();
        StatsSnapshot {
            bypassed: get("bypassed"),
            unauthenticated: get("unauthenticated"),
            allowed: get("allowed"),
            denied: get("denied"),
            fail_open: get("fail_open"),
        }
    }

    /// Content type of [`AdmissionStats::render_prometheus`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Render the totals in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| GatewayError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}
