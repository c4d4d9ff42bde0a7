//! Scan requests and the append-only scan event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::package::{AnyPackage, PackageStatus};
use super::session::{ScanMode, SessionId};
use super::tracking::TrackingFamily;
use super::{AuthorizationId, BranchId, ClientId, OperatorId, PackageId, ScanEventId};
use crate::error::{Result, ScanError};

/// One scan as submitted by a terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub session_id: SessionId,
    /// Raw barcode text
    pub tracking_code: String,
    pub scan_type: ScanMode,
    pub branch_id: BranchId,
    pub operator_id: OperatorId,
    #[serde(default)]
    pub notes: Option<String>,
    /// Captured by the high-risk intake workflow once a supervisor has authorized
    #[serde(default)]
    pub express_details: Option<ExpressIntakeDetails>,
}

/// Data captured for an external-express intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressIntakeDetails {
    pub weight_kg: f64,
    pub piece_count: u32,
    pub consignee_name: String,
    pub consignee_phone: String,
    pub description: String,
}

impl ExpressIntakeDetails {
    pub fn validate(&self) -> Result<()> {
        if !self.weight_kg.is_finite() || self.weight_kg <= 0.0 {
            return Err(ScanError::ValidationError(format!(
                "weight must be a positive number of kilograms, got {}",
                self.weight_kg
            )));
        }
        if self.piece_count == 0 {
            return Err(ScanError::ValidationError(
                "piece count must be at least 1".to_string(),
            ));
        }
        if self.consignee_name.trim().is_empty() {
            return Err(ScanError::ValidationError(
                "consignee name is required".to_string(),
            ));
        }
        let digits = self
            .consignee_phone
            .chars()
            .filter(|c| c.is_ascii_digit())
            .count();
        if digits < 7 {
            return Err(ScanError::ValidationError(format!(
                "consignee phone '{}' is too short",
                self.consignee_phone
            )));
        }
        if self.description.trim().is_empty() {
            return Err(ScanError::ValidationError(
                "package description is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Immutable audit record of one accepted scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEvent {
    pub id: ScanEventId,
    pub package_id: PackageId,
    pub tracking_number: String,
    pub family: TrackingFamily,
    pub scan_type: ScanMode,
    pub branch_id: BranchId,
    pub operator_id: OperatorId,
    /// Denormalized from the package so stats can be replayed from the log alone
    pub service_type: String,
    pub scanned_at: DateTime<Utc>,
    /// Grant consumed by this scan (external express only)
    pub authorization_id: Option<AuthorizationId>,
    pub notes: Option<String>,
    pub express_details: Option<ExpressIntakeDetails>,
}

/// Query over the scan event log. `from` is inclusive, `to` exclusive.
#[derive(Debug, Clone)]
pub struct ScanEventFilter {
    pub branch_id: Option<BranchId>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// What a terminal needs to show about the scanned package.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummary {
    pub id: PackageId,
    pub tracking_number: String,
    pub family: TrackingFamily,
    pub client_id: Option<ClientId>,
    pub service_type: String,
    pub status: PackageStatus,
    pub current_branch_id: Option<BranchId>,
}

impl From<&AnyPackage> for PackageSummary {
    fn from(package: &AnyPackage) -> Self {
        let data = package.data();
        PackageSummary {
            id: data.id,
            tracking_number: data.tracking_number.clone(),
            family: data.family,
            client_id: data.client_id,
            service_type: data.service_type.clone(),
            status: package.status(),
            current_branch_id: package.current_branch_id(),
        }
    }
}
