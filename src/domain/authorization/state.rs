//! Gate states and the supervisor grant.
//!
//! Each terminal session carries one gate. The generic parameter on `Gate<T>`
//! records where the terminal is in the supervisor flow, so only the operations
//! legal in that state can be called.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::SessionId;
use crate::domain::{AuthorizationId, BranchId, SupervisorId};

/// Marker trait for valid gate states.
pub trait GateState: Send + Sync {}

/// Supervisor authorization gate for one terminal.
#[derive(Debug, Clone, Serialize)]
pub struct Gate<T: GateState> {
    /// The current state of the gate.
    pub state: T,
    /// Branch whose supervisor roster can open this gate.
    pub branch_id: BranchId,
}

// ============================================================================
// Gate States
// ============================================================================

/// No authorization requested.
#[derive(Debug, Clone, Serialize)]
pub struct PendingScan {}

impl GateState for PendingScan {}

/// An external-express code was submitted; waiting for a supervisor PIN.
#[derive(Debug, Clone, Serialize)]
pub struct AwaitingPin {
    pub tracking_number: String,
    pub requested_at: DateTime<Utc>,
    /// Wrong PINs entered for this request
    pub failed_attempts: u32,
}

impl GateState for AwaitingPin {}

/// A supervisor grant is live; the high-risk intake workflow may run.
#[derive(Debug, Clone, Serialize)]
pub struct Authorized {
    pub grant: SupervisorAuthorization,
}

impl GateState for Authorized {}

/// Single-use elevated grant for exactly one tracking number at one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorAuthorization {
    pub id: AuthorizationId,
    pub branch_id: BranchId,
    pub supervisor_id: SupervisorId,
    pub tracking_number: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once, by the scan that used the grant
    pub consumed_at: Option<DateTime<Utc>>,
    /// Session that requested the grant
    pub session_id: Option<SessionId>,
}

impl SupervisorAuthorization {
    pub fn issue(
        branch_id: BranchId,
        supervisor_id: SupervisorId,
        tracking_number: &str,
        session_id: Option<SessionId>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        SupervisorAuthorization {
            id: AuthorizationId::new(),
            branch_id,
            supervisor_id,
            tracking_number: tracking_number.to_string(),
            granted_at: now,
            expires_at: now + ttl,
            consumed_at: None,
            session_id,
        }
    }

    /// Unconsumed and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && now < self.expires_at
    }

    pub fn covers(&self, branch_id: BranchId, tracking_number: &str) -> bool {
        self.branch_id == branch_id && self.tracking_number == tracking_number
    }
}

// ============================================================================
// Unified Gate Representation
// ============================================================================

/// Enum that can hold a gate in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", content = "gate")]
pub enum AnyGate {
    PendingScan(Gate<PendingScan>),
    AwaitingPin(Gate<AwaitingPin>),
    Authorized(Gate<Authorized>),
}

impl AnyGate {
    pub fn branch_id(&self) -> BranchId {
        match self {
            AnyGate::PendingScan(g) => g.branch_id,
            AnyGate::AwaitingPin(g) => g.branch_id,
            AnyGate::Authorized(g) => g.branch_id,
        }
    }

    /// Get the variant name of the current state.
    pub fn variant(&self) -> &'static str {
        match self {
            AnyGate::PendingScan(_) => "PendingScan",
            AnyGate::AwaitingPin(_) => "AwaitingPin",
            AnyGate::Authorized(_) => "Authorized",
        }
    }

    /// Tracking number the gate is currently working on, if any.
    pub fn tracking_number(&self) -> Option<&str> {
        match self {
            AnyGate::PendingScan(_) => None,
            AnyGate::AwaitingPin(g) => Some(&g.state.tracking_number),
            AnyGate::Authorized(g) => Some(&g.state.grant.tracking_number),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AnyGate::PendingScan(_))
    }

    /// Try to extract the live grant.
    pub fn as_authorized(&self) -> Option<&Gate<Authorized>> {
        match self {
            AnyGate::Authorized(g) => Some(g),
            _ => None,
        }
    }
}

impl From<Gate<PendingScan>> for AnyGate {
    fn from(g: Gate<PendingScan>) -> Self {
        AnyGate::PendingScan(g)
    }
}

impl From<Gate<AwaitingPin>> for AnyGate {
    fn from(g: Gate<AwaitingPin>) -> Self {
        AnyGate::AwaitingPin(g)
    }
}

impl From<Gate<Authorized>> for AnyGate {
    fn from(g: Gate<Authorized>) -> Self {
        AnyGate::Authorized(g)
    }
}
