//! In-memory implementation of [`Storage`].
//!
//! All state sits behind one mutex and `commit_scan` holds it for the whole
//! commit, which gives the same all-or-nothing behaviour as a serializable
//! transaction. Used by the test suite and by the service when no database is
//! configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

use super::{Precondition, ScanCommit, Storage};
use crate::domain::authorization::SupervisorAuthorization;
use crate::domain::package::AnyPackage;
use crate::domain::scan::{ScanEvent, ScanEventFilter};
use crate::domain::stats::{DailyStatsSnapshot, snapshots_by_branch};
use crate::domain::tracking::TrackingFamily;
use crate::domain::{AuthorizationId, BranchId, PackageId};
use crate::error::{Result, ScanError};

struct StoredGrant {
    grant: SupervisorAuthorization,
    revoked: bool,
}

#[derive(Default)]
struct Inner {
    packages: HashMap<PackageId, AnyPackage>,
    by_tracking: HashMap<(TrackingFamily, String), PackageId>,
    events: Vec<ScanEvent>,
    grants: HashMap<AuthorizationId, StoredGrant>,
    stats: HashMap<(BranchId, NaiveDate), DailyStatsSnapshot>,
}

#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
    fail_next_commit: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_scan` fail as if the database were unreachable.
    pub fn inject_commit_failure(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn scan_event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// A stored grant and whether it was revoked.
    pub fn authorization(&self, id: AuthorizationId) -> Option<(SupervisorAuthorization, bool)> {
        self.inner
            .lock()
            .grants
            .get(&id)
            .map(|g| (g.grant.clone(), g.revoked))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn register_package(&self, package: &AnyPackage) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let data = package.data();
        let key = (data.family, data.tracking_number.clone());
        if inner.by_tracking.contains_key(&key) {
            return Err(ScanError::ValidationError(format!(
                "package {} is already registered",
                data.tracking_number
            )));
        }
        inner.by_tracking.insert(key, data.id);
        inner.packages.insert(data.id, package.clone());
        Ok(())
    }

    async fn find_package(
        &self,
        family: TrackingFamily,
        tracking_number: &str,
    ) -> Result<Option<AnyPackage>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_tracking
            .get(&(family, tracking_number.to_string()))
            .and_then(|id| inner.packages.get(id))
            .cloned())
    }

    async fn get_package(&self, id: PackageId) -> Result<AnyPackage> {
        self.inner
            .lock()
            .packages
            .get(&id)
            .cloned()
            .ok_or(ScanError::PackageNotFound(id))
    }

    #[tracing::instrument(skip(self, commit), fields(tracking_number = %commit.event.tracking_number, scan_type = %commit.event.scan_type))]
    async fn commit_scan(&self, commit: ScanCommit) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(ScanError::Other(anyhow!("injected storage failure")));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let data = commit.package.data();
        let package_id = data.id;
        let key = (data.family, data.tracking_number.clone());

        let precondition_holds = match commit.precondition {
            Precondition::Absent => !inner.by_tracking.contains_key(&key),
            Precondition::Matches(expected) => inner
                .by_tracking
                .get(&key)
                .and_then(|id| inner.packages.get(id))
                .is_some_and(|current| current.id() == package_id && current.snapshot() == expected),
        };
        if !precondition_holds {
            tracing::debug!("Package precondition no longer holds");
            return Err(ScanError::DuplicateScan(data.tracking_number.clone()));
        }

        let event = &commit.event;
        if let Some(grant_id) = commit.consume_authorization {
            let stored = inner.grants.get_mut(&grant_id).filter(|g| {
                !g.revoked
                    && g.grant.is_active(event.scanned_at)
                    && g.grant.covers(event.branch_id, &event.tracking_number)
            });
            match stored {
                Some(g) => g.grant.consumed_at = Some(event.scanned_at),
                None => {
                    return Err(ScanError::AuthorizationUnavailable(
                        event.tracking_number.clone(),
                    ));
                }
            }
        }

        inner
            .stats
            .entry((event.branch_id, commit.business_date))
            .or_insert_with(|| DailyStatsSnapshot::empty(event.branch_id, commit.business_date))
            .record(event.scan_type, &event.service_type);
        inner.by_tracking.insert(key, package_id);
        inner.packages.insert(package_id, commit.package);
        inner.events.push(commit.event);
        Ok(())
    }

    async fn issue_authorization(&self, grant: &SupervisorAuthorization) -> Result<()> {
        let mut inner = self.inner.lock();
        for stored in inner.grants.values_mut() {
            if stored.grant.consumed_at.is_none()
                && stored.grant.covers(grant.branch_id, &grant.tracking_number)
            {
                stored.revoked = true;
            }
        }
        inner.grants.insert(
            grant.id,
            StoredGrant {
                grant: grant.clone(),
                revoked: false,
            },
        );
        Ok(())
    }

    async fn find_authorization(
        &self,
        branch_id: BranchId,
        tracking_number: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SupervisorAuthorization>> {
        let inner = self.inner.lock();
        Ok(inner
            .grants
            .values()
            .filter(|g| {
                !g.revoked && g.grant.is_active(now) && g.grant.covers(branch_id, tracking_number)
            })
            .max_by_key(|g| g.grant.granted_at)
            .map(|g| g.grant.clone()))
    }

    async fn revoke_authorization(&self, id: AuthorizationId) -> Result<()> {
        if let Some(stored) = self.inner.lock().grants.get_mut(&id)
            && stored.grant.consumed_at.is_none()
        {
            stored.revoked = true;
        }
        Ok(())
    }

    async fn list_scan_events(&self, filter: ScanEventFilter) -> Result<Vec<ScanEvent>> {
        let inner = self.inner.lock();
        let mut events: Vec<ScanEvent> = inner
            .events
            .iter()
            .filter(|e| filter.branch_id.is_none_or(|b| e.branch_id == b))
            .filter(|e| e.scanned_at >= filter.from && e.scanned_at < filter.to)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.scanned_at);
        Ok(events)
    }

    async fn get_daily_stats(
        &self,
        branch_id: BranchId,
        date: NaiveDate,
    ) -> Result<DailyStatsSnapshot> {
        Ok(self
            .inner
            .lock()
            .stats
            .get(&(branch_id, date))
            .cloned()
            .unwrap_or_else(|| DailyStatsSnapshot::empty(branch_id, date)))
    }

    async fn rebuild_daily_stats(
        &self,
        branch_id: Option<BranchId>,
        date: NaiveDate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyStatsSnapshot>> {
        // Held across read and overwrite so commit_scan cannot interleave.
        let mut inner = self.inner.lock();
        let mut snapshots = snapshots_by_branch(
            date,
            inner
                .events
                .iter()
                .filter(|e| branch_id.is_none_or(|b| e.branch_id == b))
                .filter(|e| e.scanned_at >= from && e.scanned_at < to),
        );
        if let Some(only) = branch_id {
            snapshots
                .entry(only)
                .or_insert_with(|| DailyStatsSnapshot::empty(only, date));
        }

        inner
            .stats
            .retain(|(b, d), _| *d != date || branch_id.is_some_and(|only| only != *b));
        for snapshot in snapshots.values() {
            inner
                .stats
                .insert((snapshot.branch_id, date), snapshot.clone());
        }
        Ok(snapshots.into_values().collect())
    }
}
