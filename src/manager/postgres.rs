//! PostgreSQL implementation of Storage.
//!
//! `commit_scan` runs in one transaction. Both preconditions are enforced by the
//! database rather than by a prior read: first contact is an
//! `INSERT ... ON CONFLICT DO NOTHING`, every later movement is an `UPDATE` whose
//! `WHERE` clause repeats the status and branch the engine saw. Under
//! concurrent scans of the same package exactly one statement affects a row.
//! Grant consumption works the same way, and a partial unique index keeps at most
//! one open grant per `(branch, tracking number)`.
//!
//! Daily counters are guarded by a transaction-scoped advisory lock per business
//! day: commits take it shared, a rebuild takes it exclusively, so the counters a
//! rebuild writes are never overtaken by a commit it did not see.
//!
//! # Example
//! ```ignore
//! use scan_engine::PostgresScanStorage;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgresql://localhost/scan_engine").await?;
//! scan_engine::migrator().run(&pool).await?;
//! let storage = Arc::new(PostgresScanStorage::new(pool));
//! ```

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use super::{Precondition, ScanCommit, Storage};
use crate::domain::authorization::SupervisorAuthorization;
use crate::domain::package::{AnyPackage, LastScan, PackageData, PackageStatus};
use crate::domain::scan::{ExpressIntakeDetails, ScanEvent, ScanEventFilter};
use crate::domain::session::{ScanMode, SessionId};
use crate::domain::stats::{DailyStatsSnapshot, ServiceCounts};
use crate::domain::tracking::TrackingFamily;
use crate::domain::{
    AuthorizationId, BranchId, ClientId, OperatorId, PackageId, ScanEventId, SupervisorId,
};
use crate::error::{Result, ScanError};

const PACKAGE_COLUMNS: &str = "id, tracking_number, family, client_id, service_type, registered_at, \
     status, current_branch_id, status_since, last_scan_type, last_scan_branch_id, last_scan_at";

const EVENT_COLUMNS: &str = "id, package_id, tracking_number, family, scan_type, branch_id, \
     operator_id, service_type, scanned_at, authorization_id, notes, express_details";

const GRANT_COLUMNS: &str = "id, branch_id, supervisor_id, tracking_number, session_id, \
     granted_at, expires_at, consumed_at";

/// PostgreSQL implementation of the [`Storage`] trait.
pub struct PostgresScanStorage {
    pool: PgPool,
}

impl PostgresScanStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Columns the package row is written with.
struct PackageColumns<'a> {
    data: &'a PackageData,
    status: PackageStatus,
    branch_id: Option<i64>,
    since: DateTime<Utc>,
}

impl<'a> PackageColumns<'a> {
    fn of(package: &'a AnyPackage) -> Self {
        PackageColumns {
            data: package.data(),
            status: package.status(),
            branch_id: package.current_branch_id().map(|b| b.0),
            since: package.status_since(),
        }
    }

    fn last_scan_type(&self) -> Option<&'static str> {
        self.data.last_scan.map(|s| s.scan_type.as_str())
    }

    fn last_scan_branch(&self) -> Option<i64> {
        self.data.last_scan.map(|s| s.branch_id.0)
    }

    fn last_scan_at(&self) -> Option<DateTime<Utc>> {
        self.data.last_scan.map(|s| s.at)
    }
}

fn read<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| ScanError::Other(anyhow!("Failed to read {}: {}", column, e)))
}

fn parse_family(raw: &str) -> Result<TrackingFamily> {
    raw.parse::<TrackingFamily>()
        .map_err(|e| ScanError::Other(anyhow!("Invalid family '{}': {}", raw, e)))
}

fn parse_mode(raw: &str) -> Result<ScanMode> {
    raw.parse::<ScanMode>()
        .map_err(|e| ScanError::Other(anyhow!("Invalid scan type '{}': {}", raw, e)))
}

/// Advisory lock key for one business day's counters.
fn stats_lock_key(date: NaiveDate) -> i64 {
    (0x5343_414E_i64 << 32) | i64::from(date.num_days_from_ce())
}

fn package_from_row(row: &PgRow) -> Result<AnyPackage> {
    let tracking_number: String = read(row, "tracking_number")?;
    let family: String = read(row, "family")?;
    let status: String = read(row, "status")?;
    let status = status
        .parse::<PackageStatus>()
        .map_err(|e| ScanError::Other(anyhow!("Invalid package status '{}': {}", status, e)))?;

    let last_scan_type: Option<String> = read(row, "last_scan_type")?;
    let last_scan_branch: Option<i64> = read(row, "last_scan_branch_id")?;
    let last_scan_at: Option<DateTime<Utc>> = read(row, "last_scan_at")?;
    let last_scan = match (last_scan_type, last_scan_branch, last_scan_at) {
        (Some(scan_type), Some(branch_id), Some(at)) => Some(LastScan {
            scan_type: parse_mode(&scan_type)?,
            branch_id: BranchId(branch_id),
            at,
        }),
        _ => None,
    };

    let data = PackageData {
        id: PackageId(read::<Uuid>(row, "id")?),
        family: parse_family(&family)?,
        tracking_number,
        client_id: read::<Option<i64>>(row, "client_id")?.map(ClientId),
        service_type: read(row, "service_type")?,
        registered_at: read(row, "registered_at")?,
        last_scan,
    };
    let branch_id = read::<Option<i64>>(row, "current_branch_id")?.map(BranchId);
    let since: DateTime<Utc> = read(row, "status_since")?;

    AnyPackage::from_parts(data, status, branch_id, since)
        .map_err(|e| ScanError::Other(anyhow!("Corrupt package row: {}", e)))
}

fn event_from_row(row: &PgRow) -> Result<ScanEvent> {
    let family: String = read(row, "family")?;
    let scan_type: String = read(row, "scan_type")?;
    let express_details: Option<serde_json::Value> = read(row, "express_details")?;
    let express_details = express_details
        .map(serde_json::from_value::<ExpressIntakeDetails>)
        .transpose()?;

    Ok(ScanEvent {
        id: ScanEventId(read::<Uuid>(row, "id")?),
        package_id: PackageId(read::<Uuid>(row, "package_id")?),
        tracking_number: read(row, "tracking_number")?,
        family: parse_family(&family)?,
        scan_type: parse_mode(&scan_type)?,
        branch_id: BranchId(read(row, "branch_id")?),
        operator_id: OperatorId(read(row, "operator_id")?),
        service_type: read(row, "service_type")?,
        scanned_at: read(row, "scanned_at")?,
        authorization_id: read::<Option<Uuid>>(row, "authorization_id")?.map(AuthorizationId),
        notes: read(row, "notes")?,
        express_details,
    })
}

fn grant_from_row(row: &PgRow) -> Result<SupervisorAuthorization> {
    Ok(SupervisorAuthorization {
        id: AuthorizationId(read::<Uuid>(row, "id")?),
        branch_id: BranchId(read(row, "branch_id")?),
        supervisor_id: SupervisorId(read(row, "supervisor_id")?),
        tracking_number: read(row, "tracking_number")?,
        session_id: read::<Option<Uuid>>(row, "session_id")?.map(SessionId),
        granted_at: read(row, "granted_at")?,
        expires_at: read(row, "expires_at")?,
        consumed_at: read(row, "consumed_at")?,
    })
}

#[async_trait]
impl Storage for PostgresScanStorage {
    async fn register_package(&self, package: &AnyPackage) -> Result<()> {
        let cols = PackageColumns::of(package);
        let result = sqlx::query(&format!(
            "INSERT INTO packages ({PACKAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (family, tracking_number) DO NOTHING"
        ))
        .bind(cols.data.id.0)
        .bind(&cols.data.tracking_number)
        .bind(cols.data.family.as_str())
        .bind(cols.data.client_id.map(|c| c.0))
        .bind(&cols.data.service_type)
        .bind(cols.data.registered_at)
        .bind(cols.status.as_str())
        .bind(cols.branch_id)
        .bind(cols.since)
        .bind(cols.last_scan_type())
        .bind(cols.last_scan_branch())
        .bind(cols.last_scan_at())
        .execute(&self.pool)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to register package: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(ScanError::ValidationError(format!(
                "package {} is already registered",
                cols.data.tracking_number
            )));
        }
        Ok(())
    }

    async fn find_package(
        &self,
        family: TrackingFamily,
        tracking_number: &str,
    ) -> Result<Option<AnyPackage>> {
        let row = sqlx::query(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM packages WHERE family = $1 AND tracking_number = $2"
        ))
        .bind(family.as_str())
        .bind(tracking_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to fetch package: {}", e)))?;

        row.as_ref().map(package_from_row).transpose()
    }

    async fn get_package(&self, id: PackageId) -> Result<AnyPackage> {
        let row = sqlx::query(&format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to fetch package: {}", e)))?
            .ok_or(ScanError::PackageNotFound(id))?;
        package_from_row(&row)
    }

    #[tracing::instrument(skip(self, commit), fields(tracking_number = %commit.event.tracking_number, scan_type = %commit.event.scan_type))]
    async fn commit_scan(&self, commit: ScanCommit) -> Result<()> {
        let event = &commit.event;
        let cols = PackageColumns::of(&commit.package);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to begin transaction: {}", e)))?;

        // Commits share the day's lock; a rebuild of that day takes it exclusively.
        sqlx::query("SELECT pg_advisory_xact_lock_shared($1)")
            .bind(stats_lock_key(commit.business_date))
            .execute(&mut *tx)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to lock daily stats: {}", e)))?;

        let written = match commit.precondition {
            Precondition::Absent => sqlx::query(&format!(
                "INSERT INTO packages ({PACKAGE_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (family, tracking_number) DO NOTHING"
            ))
            .bind(cols.data.id.0)
            .bind(&cols.data.tracking_number)
            .bind(cols.data.family.as_str())
            .bind(cols.data.client_id.map(|c| c.0))
            .bind(&cols.data.service_type)
            .bind(cols.data.registered_at)
            .bind(cols.status.as_str())
            .bind(cols.branch_id)
            .bind(cols.since)
            .bind(cols.last_scan_type())
            .bind(cols.last_scan_branch())
            .bind(cols.last_scan_at())
            .execute(&mut *tx)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to insert package: {}", e)))?,
            Precondition::Matches(expected) => sqlx::query(
                r#"
                UPDATE packages
                SET status = $2,
                    current_branch_id = $3,
                    status_since = $4,
                    last_scan_type = $5,
                    last_scan_branch_id = $6,
                    last_scan_at = $7
                WHERE id = $1
                  AND status = $8
                  AND current_branch_id IS NOT DISTINCT FROM $9
                "#,
            )
            .bind(cols.data.id.0)
            .bind(cols.status.as_str())
            .bind(cols.branch_id)
            .bind(cols.since)
            .bind(cols.last_scan_type())
            .bind(cols.last_scan_branch())
            .bind(cols.last_scan_at())
            .bind(expected.status.as_str())
            .bind(expected.branch_id.map(|b| b.0))
            .execute(&mut *tx)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to update package: {}", e)))?,
        };
        if written.rows_affected() == 0 {
            tracing::debug!("Package precondition no longer holds");
            return Err(ScanError::DuplicateScan(event.tracking_number.clone()));
        }

        if let Some(grant_id) = commit.consume_authorization {
            let consumed = sqlx::query(
                r#"
                UPDATE supervisor_authorizations
                SET consumed_at = $2
                WHERE id = $1
                  AND consumed_at IS NULL
                  AND revoked_at IS NULL
                  AND expires_at > $2
                  AND branch_id = $3
                  AND tracking_number = $4
                "#,
            )
            .bind(grant_id.0)
            .bind(event.scanned_at)
            .bind(event.branch_id.0)
            .bind(&event.tracking_number)
            .execute(&mut *tx)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to consume authorization: {}", e)))?;

            if consumed.rows_affected() == 0 {
                return Err(ScanError::AuthorizationUnavailable(
                    event.tracking_number.clone(),
                ));
            }
        }

        let express_details = event
            .express_details
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(&format!(
            "INSERT INTO scan_events ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(event.id.0)
        .bind(event.package_id.0)
        .bind(&event.tracking_number)
        .bind(event.family.as_str())
        .bind(event.scan_type.as_str())
        .bind(event.branch_id.0)
        .bind(event.operator_id.0)
        .bind(&event.service_type)
        .bind(event.scanned_at)
        .bind(event.authorization_id.map(|a| a.0))
        .bind(&event.notes)
        .bind(express_details)
        .execute(&mut *tx)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to append scan event: {}", e)))?;

        let (intake, dispatch): (i64, i64) = match event.scan_type {
            ScanMode::Intake => (1, 0),
            ScanMode::Dispatch => (0, 1),
        };
        sqlx::query(
            r#"
            INSERT INTO daily_stats (branch_id, business_date, service_type, intake, dispatch)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (branch_id, business_date, service_type) DO UPDATE
            SET intake = daily_stats.intake + EXCLUDED.intake,
                dispatch = daily_stats.dispatch + EXCLUDED.dispatch
            "#,
        )
        .bind(event.branch_id.0)
        .bind(commit.business_date)
        .bind(&event.service_type)
        .bind(intake)
        .bind(dispatch)
        .execute(&mut *tx)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to increment daily stats: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    async fn issue_authorization(&self, grant: &SupervisorAuthorization) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to begin transaction: {}", e)))?;

        let revoked = sqlx::query(
            r#"
            UPDATE supervisor_authorizations
            SET revoked_at = $3
            WHERE branch_id = $1
              AND tracking_number = $2
              AND consumed_at IS NULL
              AND revoked_at IS NULL
            "#,
        )
        .bind(grant.branch_id.0)
        .bind(&grant.tracking_number)
        .bind(grant.granted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to revoke previous grants: {}", e)))?;

        sqlx::query(&format!(
            "INSERT INTO supervisor_authorizations ({GRANT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(grant.id.0)
        .bind(grant.branch_id.0)
        .bind(grant.supervisor_id.0)
        .bind(&grant.tracking_number)
        .bind(grant.session_id.map(|s| s.0))
        .bind(grant.granted_at)
        .bind(grant.expires_at)
        .bind(grant.consumed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to insert authorization: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to commit transaction: {}", e)))?;

        if revoked.rows_affected() > 0 {
            tracing::debug!(
                revoked = revoked.rows_affected(),
                tracking_number = %grant.tracking_number,
                "Superseded open grants"
            );
        }
        Ok(())
    }

    async fn find_authorization(
        &self,
        branch_id: BranchId,
        tracking_number: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SupervisorAuthorization>> {
        let row = sqlx::query(&format!(
            "SELECT {GRANT_COLUMNS} FROM supervisor_authorizations \
             WHERE branch_id = $1 AND tracking_number = $2 \
               AND consumed_at IS NULL AND revoked_at IS NULL AND expires_at > $3 \
             ORDER BY granted_at DESC LIMIT 1"
        ))
        .bind(branch_id.0)
        .bind(tracking_number)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to fetch authorization: {}", e)))?;

        row.as_ref().map(grant_from_row).transpose()
    }

    async fn revoke_authorization(&self, id: AuthorizationId) -> Result<()> {
        sqlx::query(
            "UPDATE supervisor_authorizations SET revoked_at = NOW() \
             WHERE id = $1 AND consumed_at IS NULL AND revoked_at IS NULL",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to revoke authorization: {}", e)))?;
        Ok(())
    }

    async fn list_scan_events(&self, filter: ScanEventFilter) -> Result<Vec<ScanEvent>> {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(format!(
            "SELECT {EVENT_COLUMNS} FROM scan_events WHERE scanned_at >= "
        ));
        query_builder.push_bind(filter.from);
        query_builder.push(" AND scanned_at < ");
        query_builder.push_bind(filter.to);
        if let Some(branch_id) = filter.branch_id {
            query_builder.push(" AND branch_id = ");
            query_builder.push_bind(branch_id.0);
        }
        query_builder.push(" ORDER BY scanned_at ASC, id ASC");

        let rows = query_builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to list scan events: {}", e)))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn get_daily_stats(
        &self,
        branch_id: BranchId,
        date: NaiveDate,
    ) -> Result<DailyStatsSnapshot> {
        let rows = sqlx::query(
            "SELECT service_type, intake, dispatch FROM daily_stats \
             WHERE branch_id = $1 AND business_date = $2 ORDER BY service_type",
        )
        .bind(branch_id.0)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ScanError::Other(anyhow!("Failed to fetch daily stats: {}", e)))?;

        let mut snapshot = DailyStatsSnapshot::empty(branch_id, date);
        for row in &rows {
            let intake = read::<i64>(row, "intake")?.max(0) as u64;
            let dispatch = read::<i64>(row, "dispatch")?.max(0) as u64;
            snapshot.intake += intake;
            snapshot.dispatch += dispatch;
            snapshot.by_service.push(ServiceCounts {
                service_type: read(row, "service_type")?,
                intake,
                dispatch,
            });
        }
        Ok(snapshot)
    }

    async fn rebuild_daily_stats(
        &self,
        branch_id: Option<BranchId>,
        date: NaiveDate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyStatsSnapshot>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to begin transaction: {}", e)))?;

        // Waits for in-flight commits of this day and holds new ones back
        // until the rebuilt counters are committed.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(stats_lock_key(date))
            .execute(&mut *tx)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to lock daily stats: {}", e)))?;

        let mut clear: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("DELETE FROM daily_stats WHERE business_date = ");
        clear.push_bind(date);
        if let Some(branch_id) = branch_id {
            clear.push(" AND branch_id = ");
            clear.push_bind(branch_id.0);
        }
        clear
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to clear daily stats: {}", e)))?;

        let mut fill: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO daily_stats (branch_id, business_date, service_type, intake, dispatch) \
             SELECT branch_id, ",
        );
        fill.push_bind(date);
        fill.push(
            "::date, service_type, \
             COUNT(*) FILTER (WHERE scan_type = 'intake'), \
             COUNT(*) FILTER (WHERE scan_type = 'dispatch') \
             FROM scan_events WHERE scanned_at >= ",
        );
        fill.push_bind(from);
        fill.push(" AND scanned_at < ");
        fill.push_bind(to);
        if let Some(branch_id) = branch_id {
            fill.push(" AND branch_id = ");
            fill.push_bind(branch_id.0);
        }
        fill.push(
            " GROUP BY branch_id, service_type \
             RETURNING branch_id, service_type, intake, dispatch",
        );
        let rows = fill
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to rebuild daily stats: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ScanError::Other(anyhow!("Failed to commit transaction: {}", e)))?;

        let mut snapshots: BTreeMap<BranchId, DailyStatsSnapshot> = BTreeMap::new();
        if let Some(only) = branch_id {
            snapshots.insert(only, DailyStatsSnapshot::empty(only, date));
        }
        for row in &rows {
            let branch = BranchId(read(row, "branch_id")?);
            let intake = read::<i64>(row, "intake")?.max(0) as u64;
            let dispatch = read::<i64>(row, "dispatch")?.max(0) as u64;
            let snapshot = snapshots
                .entry(branch)
                .or_insert_with(|| DailyStatsSnapshot::empty(branch, date));
            snapshot.intake += intake;
            snapshot.dispatch += dispatch;
            snapshot.by_service.push(ServiceCounts {
                service_type: read(row, "service_type")?,
                intake,
                dispatch,
            });
        }
        let mut snapshots: Vec<DailyStatsSnapshot> = snapshots.into_values().collect();
        for snapshot in &mut snapshots {
            snapshot
                .by_service
                .sort_by(|a, b| a.service_type.cmp(&b.service_type));
        }
        tracing::debug!(%date, branches = snapshots.len(), "Rebuilt daily stats");
        Ok(snapshots)
    }
}
