//! Daily stats aggregator.
//!
//! Counters are incremented inside [`Storage::commit_scan`]; this module reads
//! them and rebuilds them from the scan event log, either on demand or from a
//! background loop. A rebuild replaces the day's counters in one step against
//! concurrent commits, so it never drops an increment.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::domain::BranchId;
use crate::domain::stats::DailyStatsSnapshot;
use crate::error::Result;
use crate::manager::Storage;

pub struct DailyStatsAggregator<S: Storage> {
    storage: Arc<S>,
    config: EngineConfig,
}

impl<S: Storage + 'static> DailyStatsAggregator<S> {
    pub fn new(storage: Arc<S>, config: EngineConfig) -> Self {
        Self { storage, config }
    }

    pub fn today(&self) -> NaiveDate {
        self.config.business_date(Utc::now())
    }

    pub async fn snapshot(&self, branch_id: BranchId, date: NaiveDate) -> Result<DailyStatsSnapshot> {
        self.storage.get_daily_stats(branch_id, date).await
    }

    /// Recompute one branch-day from the event log.
    pub async fn rebuild(&self, branch_id: BranchId, date: NaiveDate) -> Result<DailyStatsSnapshot> {
        let (from, to) = self.config.business_day_window(date);
        let rebuilt = self
            .storage
            .rebuild_daily_stats(Some(branch_id), date, from, to)
            .await?;
        Ok(rebuilt
            .into_iter()
            .find(|s| s.branch_id == branch_id)
            .unwrap_or_else(|| DailyStatsSnapshot::empty(branch_id, date)))
    }

    /// Recompute every branch for `date`. Returns the number of branches that
    /// scanned that day.
    #[tracing::instrument(skip(self), fields(date = %date))]
    pub async fn rebuild_day(&self, date: NaiveDate) -> Result<usize> {
        let (from, to) = self.config.business_day_window(date);
        let rebuilt = self
            .storage
            .rebuild_daily_stats(None, date, from, to)
            .await?;
        tracing::debug!(branches = rebuilt.len(), "Rebuilt daily stats from scan events");
        Ok(rebuilt.len())
    }

    /// Spawn the periodic rebuild of today's counters.
    ///
    /// Returns `None` when `stats_rebuild_interval_ms` is unset.
    pub fn spawn(self: Arc<Self>, shutdown_token: CancellationToken) -> Option<JoinHandle<()>> {
        let interval_ms = self.config.stats_rebuild_interval_ms?;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            tracing::info!(interval_ms = interval_ms, "Daily stats rebuild loop started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let today = self.today();
                        if let Err(e) = self.rebuild_day(today).await {
                            tracing::warn!(error = %e, date = %today, "Daily stats rebuild failed");
                        }
                    }
                    _ = shutdown_token.cancelled() => {
                        tracing::info!("Shutting down daily stats rebuild loop");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::memory::InMemoryStorage;

    #[tokio::test]
    async fn test_rebuild_day_without_events_reports_no_branches() {
        let storage = Arc::new(InMemoryStorage::new());
        let aggregator = DailyStatsAggregator::new(storage.clone(), EngineConfig::default());
        let today = aggregator.today();

        assert_eq!(aggregator.rebuild_day(today).await.unwrap(), 0);
        let snapshot = aggregator.snapshot(BranchId(7), today).await.unwrap();
        assert_eq!(snapshot, DailyStatsSnapshot::empty(BranchId(7), today));
    }

    #[tokio::test]
    async fn test_loop_disabled_without_interval() {
        let storage = Arc::new(InMemoryStorage::new());
        let config = EngineConfig {
            stats_rebuild_interval_ms: None,
            ..Default::default()
        };
        let aggregator = Arc::new(DailyStatsAggregator::new(storage, config));
        assert!(aggregator.spawn(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let storage = Arc::new(InMemoryStorage::new());
        let config = EngineConfig {
            stats_rebuild_interval_ms: Some(10),
            ..Default::default()
        };
        let aggregator = Arc::new(DailyStatsAggregator::new(storage, config));
        let token = CancellationToken::new();
        let handle = aggregator.spawn(token.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after cancellation")
            .unwrap();
    }
}
