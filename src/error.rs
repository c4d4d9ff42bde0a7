//! Error types for the scan engine.
//!
//! Every rejection an operator can see is a typed variant here. [`ScanError::kind`]
//! groups them into the categories the terminal reacts to (rescan, reset the batch,
//! call a supervisor, report a transition problem, or retry after an outage).

use serde::Serialize;
use thiserror::Error;

use crate::domain::package::PackageStatus;
use crate::domain::session::{ScanMode, SessionId};
use crate::domain::tracking::TrackingFamily;
use crate::domain::{BranchId, OperatorId, PackageId};

/// Result type alias using the scan engine error type.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Main error type for the scan engine.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Barcode did not match any tracking family
    #[error("unrecognized tracking format: '{0}'")]
    UnrecognizedFormat(String),

    /// Session already has a different family open
    #[error(
        "family mismatch: batch is open for {open}, scanned {scanned}; reset batch before scanning a different tracking family"
    )]
    FamilyMismatch {
        open: TrackingFamily,
        scanned: TrackingFamily,
    },

    /// External-express scan without a live supervisor grant
    #[error("supervisor authorization required for {0}")]
    AuthorizationRequired(String),

    /// Supervisor PIN did not match anyone on the branch roster
    #[error("incorrect supervisor credential")]
    IncorrectCredential,

    /// Too many wrong PINs at this branch recently
    #[error("too many failed supervisor attempts at branch {branch_id}; retry in {retry_after_secs}s")]
    AuthorizationThrottled {
        branch_id: BranchId,
        retry_after_secs: u64,
    },

    /// Grant expired or already consumed by another scan
    #[error("supervisor authorization for {0} is expired or already consumed")]
    AuthorizationUnavailable(String),

    /// Locally generated code with no shipment record
    #[error("no matching shipment record for {0}")]
    NoMatchingShipment(String),

    /// Transition already applied (double scan or lost race)
    #[error("duplicate scan: {0} already processed")]
    DuplicateScan(String),

    /// Dispatch attempted for a package not held at this branch
    #[error("package {tracking_number} is not at branch {branch_id}")]
    NotAtBranch {
        tracking_number: String,
        branch_id: BranchId,
    },

    /// Transition policy refuses (mode, status)
    #[error("cannot record {mode} for {tracking_number}: package is {status}")]
    InvalidTransition {
        tracking_number: String,
        mode: ScanMode,
        status: PackageStatus,
    },

    /// Operator is unknown or assigned to another branch
    #[error("operator {operator_id} is not assigned to branch {branch_id}")]
    OperatorNotAtBranch {
        operator_id: OperatorId,
        branch_id: BranchId,
    },

    /// Scan direction differs from the session's mode
    #[error("session is in {session} mode, scanned as {scanned}; switch mode before scanning")]
    ModeMismatch { session: ScanMode, scanned: ScanMode },

    /// Scan session not open (never opened, closed, or idled out)
    #[error("scan session not found: {0}")]
    SessionNotFound(SessionId),

    /// Package not found by id
    #[error("package not found: {0}")]
    PackageNotFound(PackageId),

    /// Validation error (bad intake details, wrong family for an operation)
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Printing bridge client error
    #[error("printing bridge request failed: {0}")]
    Printing(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow (storage, I/O)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Operator-facing category of a [`ScanError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rescan: the barcode shape is not recognized.
    Classification,
    /// Reset the batch or keep scanning the open family.
    BatchMismatch,
    /// Supervisor involvement needed or refused.
    Authorization,
    /// Package state does not permit the requested movement.
    Transition,
    /// Session or operator context is wrong.
    Session,
    /// Malformed input.
    Validation,
    /// Not processed; rescan once the system recovers.
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Classification => "classification",
            ErrorKind::BatchMismatch => "batch_mismatch",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Transition => "transition",
            ErrorKind::Session => "session",
            ErrorKind::Validation => "validation",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::UnrecognizedFormat(_) => ErrorKind::Classification,
            ScanError::FamilyMismatch { .. } => ErrorKind::BatchMismatch,
            ScanError::AuthorizationRequired(_)
            | ScanError::IncorrectCredential
            | ScanError::AuthorizationThrottled { .. }
            | ScanError::AuthorizationUnavailable(_) => ErrorKind::Authorization,
            ScanError::NoMatchingShipment(_)
            | ScanError::DuplicateScan(_)
            | ScanError::NotAtBranch { .. }
            | ScanError::InvalidTransition { .. }
            | ScanError::PackageNotFound(_) => ErrorKind::Transition,
            ScanError::OperatorNotAtBranch { .. }
            | ScanError::ModeMismatch { .. }
            | ScanError::SessionNotFound(_) => ErrorKind::Session,
            ScanError::ValidationError(_) => ErrorKind::Validation,
            ScanError::Printing(_) | ScanError::Serialization(_) | ScanError::Other(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// True for business outcomes the operator can act on, false for outages.
    pub fn is_rejection(&self) -> bool {
        self.kind() != ErrorKind::Infrastructure
    }

    /// Message safe to show on a terminal. Infrastructure details stay in the logs.
    pub fn reason(&self) -> String {
        match self.kind() {
            ErrorKind::Infrastructure => "scan not processed, please rescan".to_string(),
            _ => self.to_string(),
        }
    }
}
