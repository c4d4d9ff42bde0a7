//! Daily per-branch scan counters.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::BranchId;
use super::scan::ScanEvent;
use super::session::ScanMode;

/// Intake and dispatch counts for one service type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCounts {
    pub service_type: String,
    pub intake: u64,
    pub dispatch: u64,
}

/// Counts of accepted scans for one branch on one business day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatsSnapshot {
    pub branch_id: BranchId,
    pub date: NaiveDate,
    pub intake: u64,
    pub dispatch: u64,
    /// Sorted by service type
    pub by_service: Vec<ServiceCounts>,
}

impl DailyStatsSnapshot {
    pub fn empty(branch_id: BranchId, date: NaiveDate) -> Self {
        DailyStatsSnapshot {
            branch_id,
            date,
            intake: 0,
            dispatch: 0,
            by_service: Vec::new(),
        }
    }

    /// Count one accepted scan.
    pub fn record(&mut self, scan_type: ScanMode, service_type: &str) {
        let idx = match self
            .by_service
            .binary_search_by(|c| c.service_type.as_str().cmp(service_type))
        {
            Ok(idx) => idx,
            Err(idx) => {
                self.by_service.insert(
                    idx,
                    ServiceCounts {
                        service_type: service_type.to_string(),
                        ..Default::default()
                    },
                );
                idx
            }
        };
        let counts = &mut self.by_service[idx];
        match scan_type {
            ScanMode::Intake => {
                self.intake += 1;
                counts.intake += 1;
            }
            ScanMode::Dispatch => {
                self.dispatch += 1;
                counts.dispatch += 1;
            }
        }
    }

    /// Replay the event log for one branch-day.
    ///
    /// Events for other branches are ignored; the caller is responsible for
    /// selecting the business day's window.
    pub fn from_events<'a>(
        branch_id: BranchId,
        date: NaiveDate,
        events: impl IntoIterator<Item = &'a ScanEvent>,
    ) -> Self {
        let mut snapshot = DailyStatsSnapshot::empty(branch_id, date);
        for event in events {
            if event.branch_id == branch_id {
                snapshot.record(event.scan_type, &event.service_type);
            }
        }
        snapshot
    }

    pub fn total(&self) -> u64 {
        self.intake + self.dispatch
    }
}

/// Group events into snapshots keyed by branch.
pub fn snapshots_by_branch<'a>(
    date: NaiveDate,
    events: impl IntoIterator<Item = &'a ScanEvent>,
) -> BTreeMap<BranchId, DailyStatsSnapshot> {
    let mut out: BTreeMap<BranchId, DailyStatsSnapshot> = BTreeMap::new();
    for event in events {
        out.entry(event.branch_id)
            .or_insert_with(|| DailyStatsSnapshot::empty(event.branch_id, date))
            .record(event.scan_type, &event.service_type);
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::tracking::TrackingFamily;
    use crate::domain::{OperatorId, PackageId, ScanEventId};

    fn event(branch: i64, scan_type: ScanMode, service: &str) -> ScanEvent {
        ScanEvent {
            id: ScanEventId::new(),
            package_id: PackageId::new(),
            tracking_number: "AIR-1".to_string(),
            family: TrackingFamily::AirFreight,
            scan_type,
            branch_id: BranchId(branch),
            operator_id: OperatorId(11),
            service_type: service.to_string(),
            scanned_at: Utc::now(),
            authorization_id: None,
            notes: None,
            express_details: None,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 18).unwrap()
    }

    #[test]
    fn test_record_counts_by_direction_and_service() {
        let mut s = DailyStatsSnapshot::empty(BranchId(7), day());
        s.record(ScanMode::Intake, "MARITIMO");
        s.record(ScanMode::Intake, "AEREO");
        s.record(ScanMode::Dispatch, "AEREO");

        assert_eq!(s.intake, 2);
        assert_eq!(s.dispatch, 1);
        assert_eq!(s.total(), 3);
        let services: Vec<_> = s.by_service.iter().map(|c| c.service_type.as_str()).collect();
        assert_eq!(services, vec!["AEREO", "MARITIMO"]);
        assert_eq!(s.by_service[0].intake, 1);
        assert_eq!(s.by_service[0].dispatch, 1);
    }

    #[test]
    fn test_from_events_ignores_other_branches() {
        let events = vec![
            event(7, ScanMode::Intake, "AEREO"),
            event(9, ScanMode::Intake, "AEREO"),
            event(7, ScanMode::Dispatch, "AEREO"),
        ];
        let s = DailyStatsSnapshot::from_events(BranchId(7), day(), &events);
        assert_eq!((s.intake, s.dispatch), (1, 1));

        let grouped = snapshots_by_branch(day(), &events);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&BranchId(9)].intake, 1);
    }
}
