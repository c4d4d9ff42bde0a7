//! Persistence contract for the scan engine.
//!
//! This module defines the `Storage` trait: the shipment registry reads, the
//! supervisor grant lifecycle, the append-only scan event log and the daily stats
//! cache. Every write that a scan performs goes through one call,
//! [`Storage::commit_scan`], which implementations must apply as a single
//! serializable unit.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::authorization::SupervisorAuthorization;
use crate::domain::package::{AnyPackage, PackageSnapshot};
use crate::domain::scan::{ScanEvent, ScanEventFilter};
use crate::domain::stats::DailyStatsSnapshot;
use crate::domain::tracking::TrackingFamily;
use crate::domain::{AuthorizationId, BranchId, PackageId};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// What the package row must look like for a scan to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// First contact: no package with this family and tracking number exists.
    Absent,
    /// The package still has exactly the status and branch the engine read.
    Matches(PackageSnapshot),
}

/// Everything one accepted scan writes.
#[derive(Debug, Clone)]
pub struct ScanCommit {
    pub precondition: Precondition,
    /// Package after the transition
    pub package: AnyPackage,
    pub event: ScanEvent,
    /// Grant to consume (external express only)
    pub consume_authorization: Option<AuthorizationId>,
    /// Business day whose counters the scan increments
    pub business_date: NaiveDate,
}

/// Storage trait for the scan engine.
///
/// Implementations own atomicity; the engine computes transitions from what it
/// read and hands over the precondition it relied on.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Add a pre-registered shipment (registry-side; used for seeding).
    async fn register_package(&self, package: &AnyPackage) -> Result<()>;

    /// Find a package by family and normalized tracking number.
    async fn find_package(
        &self,
        family: TrackingFamily,
        tracking_number: &str,
    ) -> Result<Option<AnyPackage>>;

    /// Get a package by id.
    async fn get_package(&self, id: PackageId) -> Result<AnyPackage>;

    /// Apply one accepted scan atomically.
    ///
    /// In a single transaction:
    /// - check `precondition` against the stored package, else `DuplicateScan`
    /// - consume `consume_authorization` (unconsumed, unrevoked, unexpired at
    ///   `event.scanned_at`, covering the event's branch and tracking number), else
    ///   `AuthorizationUnavailable`
    /// - write the package, append the event, increment the daily counters
    ///
    /// Any error leaves storage untouched.
    async fn commit_scan(&self, commit: ScanCommit) -> Result<()>;

    /// Persist a new grant, revoking any other unconsumed grant for the same
    /// branch and tracking number.
    async fn issue_authorization(&self, grant: &SupervisorAuthorization) -> Result<()>;

    /// The live grant for `(branch_id, tracking_number)`, if any.
    async fn find_authorization(
        &self,
        branch_id: BranchId,
        tracking_number: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SupervisorAuthorization>>;

    /// Revoke an unconsumed grant. Consumed or unknown grants are left alone.
    async fn revoke_authorization(&self, id: AuthorizationId) -> Result<()>;

    /// Scan events matching `filter`, oldest first.
    async fn list_scan_events(&self, filter: ScanEventFilter) -> Result<Vec<ScanEvent>>;

    /// Cached counters for a branch-day; empty when nothing was counted.
    async fn get_daily_stats(&self, branch_id: BranchId, date: NaiveDate)
    -> Result<DailyStatsSnapshot>;

    /// Recompute the counters for `date` from the event log and overwrite the
    /// cached ones.
    ///
    /// `from..to` is the business day's window in UTC. With `branch_id` set only
    /// that branch is rebuilt and its snapshot is always returned; otherwise every
    /// branch with events in the window is returned and counters of branches
    /// without events are cleared. The read and the overwrite form one unit with
    /// respect to [`Storage::commit_scan`]: a scan is either in the log the
    /// rebuild reads or applied on top of the rebuilt counters.
    async fn rebuild_daily_stats(
        &self,
        branch_id: Option<BranchId>,
        date: NaiveDate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyStatsSnapshot>>;
}
