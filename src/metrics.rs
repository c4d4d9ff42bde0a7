//! Prometheus metrics for the scan engine.
//!
//! Metrics are organized into two categories:
//! - **Gauges**: Point-in-time state (open sessions)
//! - **Counters**: Cumulative totals (scans by outcome, supervisor attempts, label renders)
//!
//! Labels are kept low-cardinality: branch, direction, family and error kind.

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};

#[cfg(feature = "metrics")]
use crate::error::{ErrorKind, Result};
#[cfg(feature = "metrics")]
use crate::domain::BranchId;
#[cfg(feature = "metrics")]
use crate::domain::session::ScanMode;
#[cfg(feature = "metrics")]
use crate::domain::tracking::TrackingFamily;

/// Prometheus metrics registry for the scan engine.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct ScanMetrics {
    registry: Registry,

    // Gauges (point-in-time state)
    open_sessions: IntGauge,

    // Counters (cumulative totals)
    scans_accepted_total: CounterVec,
    scans_rejected_total: CounterVec,
    authorization_attempts_total: CounterVec,
    labels_total: CounterVec,
}

#[cfg(feature = "metrics")]
impl ScanMetrics {
    /// Create and register all scan engine metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let open_sessions = IntGauge::new(
            "scan_engine_open_sessions",
            "Number of scan sessions currently open",
        )
        .map_err(|e| anyhow::anyhow!("Failed to create open_sessions gauge: {}", e))?;

        let scans_accepted_total = CounterVec::new(
            Opts::new(
                "scan_engine_scans_accepted_total",
                "Total number of accepted scans",
            ),
            &["branch", "scan_type", "family"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create scans_accepted_total counter: {}", e))?;

        let scans_rejected_total = CounterVec::new(
            Opts::new(
                "scan_engine_scans_rejected_total",
                "Total number of rejected or failed scans by error kind",
            ),
            &["branch", "kind"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create scans_rejected_total counter: {}", e))?;

        let authorization_attempts_total = CounterVec::new(
            Opts::new(
                "scan_engine_authorization_attempts_total",
                "Total number of supervisor PIN attempts by outcome",
            ),
            &["branch", "outcome"],
        )
        .map_err(|e| {
            anyhow::anyhow!("Failed to create authorization_attempts_total counter: {}", e)
        })?;

        let labels_total = CounterVec::new(
            Opts::new(
                "scan_engine_label_requests_total",
                "Total number of label render requests by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create labels_total counter: {}", e))?;

        registry
            .register(Box::new(open_sessions.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register open_sessions: {}", e))?;
        registry
            .register(Box::new(scans_accepted_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register scans_accepted_total: {}", e))?;
        registry
            .register(Box::new(scans_rejected_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register scans_rejected_total: {}", e))?;
        registry
            .register(Box::new(authorization_attempts_total.clone()))
            .map_err(|e| {
                anyhow::anyhow!("Failed to register authorization_attempts_total: {}", e)
            })?;
        registry
            .register(Box::new(labels_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register labels_total: {}", e))?;

        Ok(Self {
            registry,
            open_sessions,
            scans_accepted_total,
            scans_rejected_total,
            authorization_attempts_total,
            labels_total,
        })
    }

    /// Get the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
        let text = String::from_utf8(buffer)
            .map_err(|e| anyhow::anyhow!("Metrics are not UTF-8: {}", e))?;
        Ok(text)
    }

    pub fn set_open_sessions(&self, count: usize) {
        self.open_sessions.set(count as i64);
    }

    pub fn record_scan_accepted(&self, branch: BranchId, scan_type: ScanMode, family: TrackingFamily) {
        let branch = branch.to_string();
        self.scans_accepted_total
            .with_label_values(&[branch.as_str(), scan_type.as_str(), family.as_str()])
            .inc();
    }

    pub fn record_scan_rejected(&self, branch: BranchId, kind: ErrorKind) {
        let branch = branch.to_string();
        self.scans_rejected_total
            .with_label_values(&[branch.as_str(), kind.as_str()])
            .inc();
    }

    /// `outcome` is one of "granted", "incorrect", "throttled".
    pub fn record_authorization_attempt(&self, branch: BranchId, outcome: &str) {
        let branch = branch.to_string();
        self.authorization_attempts_total
            .with_label_values(&[branch.as_str(), outcome])
            .inc();
    }

    pub fn record_label(&self, rendered: bool) {
        let outcome = if rendered { "rendered" } else { "failed" };
        self.labels_total.with_label_values(&[outcome]).inc();
    }
}
