//! Package states.
//!
//! The registry owns the full shipment record; the engine only reads and moves the
//! part that matters for scanning: where the package is and what happened last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::ScanMode;
use crate::domain::tracking::TrackingFamily;
use crate::domain::{BranchId, ClientId, PackageId};

/// Flat package status, as stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Created,
    InTransit,
    AtBranch,
    Delivered,
    Returned,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Created => "created",
            PackageStatus::InTransit => "in_transit",
            PackageStatus::AtBranch => "at_branch",
            PackageStatus::Delivered => "delivered",
            PackageStatus::Returned => "returned",
        }
    }
}

impl std::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PackageStatus::Created),
            "in_transit" => Ok(PackageStatus::InTransit),
            "at_branch" => Ok(PackageStatus::AtBranch),
            "delivered" => Ok(PackageStatus::Delivered),
            "returned" => Ok(PackageStatus::Returned),
            _ => Err(format!("Invalid package status: {}", s)),
        }
    }
}

/// Marker trait for valid package states.
pub trait PackageState: Send + Sync {}

/// A shipment in the registry.
///
/// The generic parameter `T` represents the current state of the package.
#[derive(Debug, Clone, Serialize)]
pub struct Package<T: PackageState> {
    /// The current state of the package.
    pub state: T,
    /// Identity and scan bookkeeping.
    pub data: PackageData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageData {
    pub id: PackageId,
    /// Unique within `family`
    pub tracking_number: String,
    pub family: TrackingFamily,
    /// None for first-contact external-express shipments
    pub client_id: Option<ClientId>,
    pub service_type: String,
    pub registered_at: DateTime<Utc>,
    pub last_scan: Option<LastScan>,
}

/// The most recent accepted scan of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastScan {
    pub scan_type: ScanMode,
    pub branch_id: BranchId,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Package States
// ============================================================================

/// Registered, never scanned into a branch.
#[derive(Debug, Clone, Serialize)]
pub struct Created {
    pub since: DateTime<Utc>,
}

impl PackageState for Created {}

/// Left a branch; not held anywhere.
#[derive(Debug, Clone, Serialize)]
pub struct InTransit {
    pub since: DateTime<Utc>,
}

impl PackageState for InTransit {}

/// Physically held at a branch.
#[derive(Debug, Clone, Serialize)]
pub struct AtBranch {
    pub branch_id: BranchId,
    pub since: DateTime<Utc>,
}

impl PackageState for AtBranch {}

#[derive(Debug, Clone, Serialize)]
pub struct Delivered {
    pub since: DateTime<Utc>,
}

impl PackageState for Delivered {}

#[derive(Debug, Clone, Serialize)]
pub struct Returned {
    pub since: DateTime<Utc>,
}

impl PackageState for Returned {}

// ============================================================================
// Unified Package Representation
// ============================================================================

/// Status and location as read, used as the write precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PackageSnapshot {
    pub status: PackageStatus,
    pub branch_id: Option<BranchId>,
}

/// Enum that can hold a package in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "package")]
pub enum AnyPackage {
    Created(Package<Created>),
    InTransit(Package<InTransit>),
    AtBranch(Package<AtBranch>),
    Delivered(Package<Delivered>),
    Returned(Package<Returned>),
}

impl AnyPackage {
    /// Get the package ID regardless of state.
    pub fn id(&self) -> PackageId {
        self.data().id
    }

    /// Get the package data regardless of state.
    pub fn data(&self) -> &PackageData {
        match self {
            AnyPackage::Created(p) => &p.data,
            AnyPackage::InTransit(p) => &p.data,
            AnyPackage::AtBranch(p) => &p.data,
            AnyPackage::Delivered(p) => &p.data,
            AnyPackage::Returned(p) => &p.data,
        }
    }

    pub fn into_data(self) -> PackageData {
        match self {
            AnyPackage::Created(p) => p.data,
            AnyPackage::InTransit(p) => p.data,
            AnyPackage::AtBranch(p) => p.data,
            AnyPackage::Delivered(p) => p.data,
            AnyPackage::Returned(p) => p.data,
        }
    }

    pub fn status(&self) -> PackageStatus {
        match self {
            AnyPackage::Created(_) => PackageStatus::Created,
            AnyPackage::InTransit(_) => PackageStatus::InTransit,
            AnyPackage::AtBranch(_) => PackageStatus::AtBranch,
            AnyPackage::Delivered(_) => PackageStatus::Delivered,
            AnyPackage::Returned(_) => PackageStatus::Returned,
        }
    }

    /// When the package entered its current status.
    pub fn status_since(&self) -> DateTime<Utc> {
        match self {
            AnyPackage::Created(p) => p.state.since,
            AnyPackage::InTransit(p) => p.state.since,
            AnyPackage::AtBranch(p) => p.state.since,
            AnyPackage::Delivered(p) => p.state.since,
            AnyPackage::Returned(p) => p.state.since,
        }
    }

    /// Branch holding the package; `None` unless `AtBranch`.
    pub fn current_branch_id(&self) -> Option<BranchId> {
        match self {
            AnyPackage::AtBranch(p) => Some(p.state.branch_id),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> PackageSnapshot {
        PackageSnapshot {
            status: self.status(),
            branch_id: self.current_branch_id(),
        }
    }

    /// Rebuild a typed package from stored columns.
    pub fn from_parts(
        data: PackageData,
        status: PackageStatus,
        branch_id: Option<BranchId>,
        since: DateTime<Utc>,
    ) -> Result<Self, String> {
        Ok(match status {
            PackageStatus::Created => AnyPackage::Created(Package {
                data,
                state: Created { since },
            }),
            PackageStatus::InTransit => AnyPackage::InTransit(Package {
                data,
                state: InTransit { since },
            }),
            PackageStatus::AtBranch => {
                let branch_id = branch_id.ok_or_else(|| {
                    format!("package {} is at_branch without a branch", data.tracking_number)
                })?;
                AnyPackage::AtBranch(Package {
                    data,
                    state: AtBranch { branch_id, since },
                })
            }
            PackageStatus::Delivered => AnyPackage::Delivered(Package {
                data,
                state: Delivered { since },
            }),
            PackageStatus::Returned => AnyPackage::Returned(Package {
                data,
                state: Returned { since },
            }),
        })
    }
}

// Conversion traits for going from typed Package to AnyPackage

impl From<Package<Created>> for AnyPackage {
    fn from(p: Package<Created>) -> Self {
        AnyPackage::Created(p)
    }
}

impl From<Package<InTransit>> for AnyPackage {
    fn from(p: Package<InTransit>) -> Self {
        AnyPackage::InTransit(p)
    }
}

impl From<Package<AtBranch>> for AnyPackage {
    fn from(p: Package<AtBranch>) -> Self {
        AnyPackage::AtBranch(p)
    }
}

impl From<Package<Delivered>> for AnyPackage {
    fn from(p: Package<Delivered>) -> Self {
        AnyPackage::Delivered(p)
    }
}

impl From<Package<Returned>> for AnyPackage {
    fn from(p: Package<Returned>) -> Self {
        AnyPackage::Returned(p)
    }
}
