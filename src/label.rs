//! Label dispatch notifier and printing bridge client.
//!
//! An accepted intake of an external-express shipment is relabeled onto the
//! domestic leg. The label reference is derived from immutable package data, so
//! asking for it again (a reprint) always yields the same reference. Rendering is
//! delegated to the printing bridge through the [`LabelPrinter`] trait; a bridge
//! failure never undoes the scan.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::package::PackageData;
use crate::domain::scan::ScanEvent;
use crate::domain::session::ScanMode;
use crate::domain::tracking::TrackingFamily;
use crate::domain::{BranchId, PackageId};
use crate::error::{Result, ScanError};

/// Stable identifier of a printed label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelReference(pub String);

impl LabelReference {
    /// Relabel reference for a package: `LBL-{tracking}-{first 8 hex of package id}`.
    pub fn relabel(package: &PackageData) -> Self {
        let id = package.id.0.simple().to_string().to_uppercase();
        LabelReference(format!("LBL-{}-{}", package.tracking_number, &id[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LabelReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body sent to the printing bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelRequest {
    pub reference: LabelReference,
    pub package_id: PackageId,
    pub tracking_number: String,
    pub service_type: String,
    pub branch_id: Option<BranchId>,
}

/// A renderable label returned by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDocument {
    pub reference: LabelReference,
    pub url: String,
}

/// Trait for rendering labels.
///
/// Implementations must be idempotent per reference: the bridge may be asked for
/// the same label any number of times.
#[async_trait]
pub trait LabelPrinter: Send + Sync {
    async fn render(&self, request: &LabelRequest) -> Result<LabelDocument>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintingConfig {
    /// Base URL of the printing bridge; labels are requested at `{bridge_url}/labels`
    pub bridge_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

#[derive(Deserialize)]
struct BridgeResponse {
    url: String,
}

/// Printing bridge client over HTTP.
#[derive(Clone)]
pub struct ReqwestLabelPrinter {
    client: reqwest::Client,
    bridge_url: String,
    timeout: Duration,
}

impl ReqwestLabelPrinter {
    pub fn new(config: &PrintingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            bridge_url: config.bridge_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[async_trait]
impl LabelPrinter for ReqwestLabelPrinter {
    #[tracing::instrument(skip(self, request), fields(reference = %request.reference, tracking_number = %request.tracking_number))]
    async fn render(&self, request: &LabelRequest) -> Result<LabelDocument> {
        let url = format!("{}/labels", self.bridge_url);
        tracing::debug!(url = %url, "Requesting label from printing bridge");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url = %url, error = %e, "Printing bridge request failed");
                e
            })?
            .error_for_status()?;

        let body: BridgeResponse = response.json().await?;
        tracing::info!(url = %body.url, "Label rendered");

        Ok(LabelDocument {
            reference: request.reference.clone(),
            url: body.url,
        })
    }
}

/// No bridge configured: every render fails, so labels carry no URL.
#[async_trait]
impl<P: LabelPrinter> LabelPrinter for Option<P> {
    async fn render(&self, request: &LabelRequest) -> Result<LabelDocument> {
        match self {
            Some(printer) => printer.render(request).await,
            None => Err(ScanError::Other(anyhow::anyhow!(
                "no printing bridge configured for {}",
                request.reference
            ))),
        }
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock printing bridge.
///
/// Renders `mock://labels/{reference}` and records every request. Failures can be
/// queued with [`MockLabelPrinter::fail_next`].
#[derive(Clone, Default)]
pub struct MockLabelPrinter {
    calls: Arc<Mutex<Vec<LabelRequest>>>,
    failures: Arc<Mutex<VecDeque<String>>>,
}

impl MockLabelPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next render fail with `message`.
    pub fn fail_next(&self, message: &str) {
        self.failures.lock().push_back(message.to_string());
    }

    pub fn get_calls(&self) -> Vec<LabelRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LabelPrinter for MockLabelPrinter {
    async fn render(&self, request: &LabelRequest) -> Result<LabelDocument> {
        self.calls.lock().push(request.clone());
        if let Some(message) = self.failures.lock().pop_front() {
            return Err(ScanError::Other(anyhow::anyhow!(message)));
        }
        Ok(LabelDocument {
            reference: request.reference.clone(),
            url: format!("mock://labels/{}", request.reference),
        })
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Outcome of a label notification for an accepted scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelNotice {
    pub reference: LabelReference,
    /// `None` when the bridge could not render; the operator reprints later
    pub url: Option<String>,
}

pub struct LabelDispatchNotifier<P: LabelPrinter> {
    printer: P,
    relabel_external_express: bool,
}

impl<P: LabelPrinter> LabelDispatchNotifier<P> {
    pub fn new(printer: P, relabel_external_express: bool) -> Self {
        Self {
            printer,
            relabel_external_express,
        }
    }

    pub fn printer(&self) -> &P {
        &self.printer
    }

    /// Whether an accepted scan produces a new outbound label.
    pub fn needs_label(&self, event: &ScanEvent) -> bool {
        self.relabel_external_express
            && event.scan_type == ScanMode::Intake
            && event.family == TrackingFamily::ExternalExpress
    }

    /// Produce the label for an accepted scan, if it needs one.
    ///
    /// Never fails: a bridge error is logged and the reference is returned without
    /// a URL.
    #[tracing::instrument(skip(self, event, package), fields(tracking_number = %event.tracking_number))]
    pub async fn notify(&self, event: &ScanEvent, package: &PackageData) -> Option<LabelNotice> {
        if !self.needs_label(event) {
            return None;
        }
        let request = label_request(package, Some(event.branch_id));
        let reference = request.reference.clone();
        match self.printer.render(&request).await {
            Ok(document) => {
                metrics::counter!("scan_engine_labels_total", "outcome" => "rendered").increment(1);
                Some(LabelNotice {
                    reference,
                    url: Some(document.url),
                })
            }
            Err(e) => {
                metrics::counter!("scan_engine_labels_total", "outcome" => "failed").increment(1);
                tracing::warn!(
                    reference = %reference,
                    error = %e,
                    "Label render failed; scan stands, operator must reprint"
                );
                Some(LabelNotice {
                    reference,
                    url: None,
                })
            }
        }
    }

    /// Re-request the label for a package. Errors are returned to the caller.
    pub async fn reprint(&self, package: &PackageData) -> Result<LabelDocument> {
        let request = label_request(package, None);
        tracing::info!(reference = %request.reference, "Reprinting label");
        self.printer.render(&request).await
    }
}

fn label_request(package: &PackageData, branch_id: Option<BranchId>) -> LabelRequest {
    LabelRequest {
        reference: LabelReference::relabel(package),
        package_id: package.id,
        tracking_number: package.tracking_number.clone(),
        service_type: package.service_type.clone(),
        branch_id,
    }
}
