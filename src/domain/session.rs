//! Scan sessions and the batch consistency guard.
//!
//! A session is the server-side view of one terminal's active scanning screen. It
//! remembers which tracking family the current batch is open for and where the
//! supervisor authorization gate stands for that terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::authorization::{AnyGate, Gate, SupervisorAuthorization};
use super::tracking::{TrackingCode, TrackingFamily};
use super::{BranchId, OperatorId, uuid_id};
use crate::error::{Result, ScanError};

uuid_id!(
    /// Unique identifier for a scan session.
    SessionId
);

/// Direction of physical package movement through a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[serde(alias = "INGRESO", alias = "ingreso")]
    Intake,
    #[serde(alias = "SALIDA", alias = "salida")]
    Dispatch,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Intake => "intake",
            ScanMode::Dispatch => "dispatch",
        }
    }
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "intake" | "INGRESO" => Ok(ScanMode::Intake),
            "dispatch" | "SALIDA" => Ok(ScanMode::Dispatch),
            _ => Err(format!("Invalid scan mode: {}", s)),
        }
    }
}

/// One terminal/operator scanning interaction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSession {
    pub id: SessionId,
    pub terminal_id: String,
    pub operator_id: OperatorId,
    pub branch_id: BranchId,
    pub mode: ScanMode,
    /// Family the current batch is locked to. Set only after a scan is recorded.
    pub open_family: Option<TrackingFamily>,
    pub gate: AnyGate,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ScanSession {
    pub fn open(
        terminal_id: String,
        operator_id: OperatorId,
        branch_id: BranchId,
        mode: ScanMode,
        now: DateTime<Utc>,
    ) -> Self {
        ScanSession {
            id: SessionId::new(),
            terminal_id,
            operator_id,
            branch_id,
            mode,
            open_family: None,
            gate: AnyGate::from(Gate::new(branch_id)),
            opened_at: now,
            last_activity_at: now,
        }
    }

    /// Batch consistency guard.
    ///
    /// Accepts when no family is open yet or the scanned family matches the open
    /// one. Never mutates the session: the caller locks the family with
    /// [`ScanSession::commit_family`] only once the scan has been recorded.
    pub fn check_batch(&self, code: &TrackingCode) -> Result<()> {
        let family = code.family();
        if family == TrackingFamily::Invalid {
            return Err(ScanError::UnrecognizedFormat(code.to_string()));
        }
        match self.open_family {
            Some(open) if open != family => Err(ScanError::FamilyMismatch {
                open,
                scanned: family,
            }),
            _ => Ok(()),
        }
    }

    pub fn commit_family(&mut self, family: TrackingFamily) {
        if self.open_family.is_none() {
            self.open_family = Some(family);
        }
    }

    /// Clear the open family. Packages are untouched.
    pub fn reset_batch(&mut self) {
        self.open_family = None;
    }

    /// Change direction. A new direction always starts a new batch and drops any
    /// half-finished supervisor flow; the returned grant (if any) must be revoked.
    pub fn switch_mode(&mut self, mode: ScanMode) -> Option<SupervisorAuthorization> {
        if self.mode == mode {
            return None;
        }
        self.mode = mode;
        self.open_family = None;
        self.cancel_gate()
    }

    /// Return the gate to `PendingScan`, handing back any unconsumed grant.
    pub fn cancel_gate(&mut self) -> Option<SupervisorAuthorization> {
        let (pending, grant) = self.take_gate().cancel();
        self.gate = AnyGate::from(pending);
        grant
    }

    /// Move the gate out, leaving a fresh `PendingScan` in its place.
    pub fn take_gate(&mut self) -> AnyGate {
        std::mem::replace(&mut self.gate, AnyGate::from(Gate::new(self.branch_id)))
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        now - self.last_activity_at > idle_timeout
    }
}
