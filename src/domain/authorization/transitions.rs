//! State transitions for the supervisor authorization gate.
//!
//! ```text
//! Gate<PendingScan> ──request()──> Gate<AwaitingPin> ──authorize()──> Gate<Authorized>
//!        ^                              │                                   │
//!        │                              └──reject_pin()──> Gate<AwaitingPin>│
//!        └───────────────────────────────────complete()─────────────────────┘
//!
//! AnyGate ──cancel()──> Gate<PendingScan>   (hands back any unconsumed grant)
//! AnyGate ──lapse()───> Gate<PendingScan>   (when the request or grant is too old)
//! ```
//!
//! Transitions are pure. Issuing, consuming and revoking the grant row is done by
//! the engine against storage; the gate only tracks what the terminal is doing.

use chrono::{DateTime, Duration, Utc};

use super::state::{AnyGate, AwaitingPin, Authorized, Gate, PendingScan, SupervisorAuthorization};
use crate::domain::BranchId;
use crate::error::{Result, ScanError};

impl Gate<PendingScan> {
    pub fn new(branch_id: BranchId) -> Self {
        Gate {
            state: PendingScan {},
            branch_id,
        }
    }

    /// Operator submitted an external-express code; ask for a supervisor.
    pub fn request(self, tracking_number: &str, now: DateTime<Utc>) -> Gate<AwaitingPin> {
        Gate {
            branch_id: self.branch_id,
            state: AwaitingPin {
                tracking_number: tracking_number.to_string(),
                requested_at: now,
                failed_attempts: 0,
            },
        }
    }
}

impl Gate<AwaitingPin> {
    /// Wrong PIN: stay in `AwaitingPin` and count the failure.
    pub fn reject_pin(self) -> Gate<AwaitingPin> {
        Gate {
            branch_id: self.branch_id,
            state: AwaitingPin {
                failed_attempts: self.state.failed_attempts + 1,
                ..self.state
            },
        }
    }

    /// Attach a freshly issued grant.
    ///
    /// The grant must be for the code and branch this gate is waiting on.
    pub fn authorize(self, grant: SupervisorAuthorization) -> Result<Gate<Authorized>> {
        if !grant.covers(self.branch_id, &self.state.tracking_number) {
            return Err(ScanError::ValidationError(format!(
                "grant for {} at branch {} does not match pending request for {} at branch {}",
                grant.tracking_number, grant.branch_id, self.state.tracking_number, self.branch_id
            )));
        }
        Ok(Gate {
            branch_id: self.branch_id,
            state: Authorized { grant },
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.state.requested_at >= ttl
    }
}

impl Gate<Authorized> {
    /// The authorized scan was recorded and consumed the grant.
    pub fn complete(self) -> Gate<PendingScan> {
        Gate::new(self.branch_id)
    }
}

impl AnyGate {
    /// Move to `AwaitingPin` for `tracking_number` from whatever state the gate is in.
    ///
    /// Re-requesting the code already awaiting a PIN keeps its failure count. Any
    /// grant held for a different code is handed back for revocation.
    pub fn request(
        self,
        tracking_number: &str,
        now: DateTime<Utc>,
    ) -> (Gate<AwaitingPin>, Option<SupervisorAuthorization>) {
        match self {
            AnyGate::AwaitingPin(g) if g.state.tracking_number == tracking_number => (g, None),
            other => {
                let (pending, grant) = other.cancel();
                (pending.request(tracking_number, now), grant)
            }
        }
    }

    /// Return to `PendingScan`, discarding partial input.
    pub fn cancel(self) -> (Gate<PendingScan>, Option<SupervisorAuthorization>) {
        match self {
            AnyGate::PendingScan(g) => (g, None),
            AnyGate::AwaitingPin(g) => (Gate::new(g.branch_id), None),
            AnyGate::Authorized(g) => {
                let branch_id = g.branch_id;
                (Gate::new(branch_id), Some(g.state.grant))
            }
        }
    }

    /// Drop a stale request or an expired grant.
    pub fn lapse(self, now: DateTime<Utc>, ttl: Duration) -> AnyGate {
        match self {
            AnyGate::AwaitingPin(g) if g.is_expired(now, ttl) => {
                AnyGate::from(Gate::new(g.branch_id))
            }
            AnyGate::Authorized(g) if !g.state.grant.is_active(now) => {
                AnyGate::from(Gate::new(g.branch_id))
            }
            other => other,
        }
    }
}
