//! Scan engine orchestration.
//!
//! One scan runs the components in order:
//!
//! ```text
//! classify ─> batch guard ─> resolve package + transition ─> authorization gate
//!          ─> commit (package, event, grant, counters) ─> label notifier
//! ```
//!
//! Scans on one session are serialized by the session lock. Scans of the same
//! tracking number from different sessions race on the storage precondition; the
//! loser sees `DuplicateScan`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::directory::BranchDirectory;
use crate::domain::authorization::{AnyGate, Gate, SupervisorAuthorization};
use crate::domain::package::{
    AnyPackage, DefaultTransitionPolicy, Package, TransitionPolicy,
};
use crate::domain::scan::{PackageSummary, ScanEvent, ScanEventFilter, ScanRequest};
use crate::domain::session::{ScanMode, ScanSession, SessionId};
use crate::domain::stats::DailyStatsSnapshot;
use crate::domain::tracking::{TrackingCode, TrackingFamily};
use crate::domain::{BranchId, OperatorId, PackageId, ScanEventId};
use crate::error::{Result, ScanError};
use crate::label::{LabelDispatchNotifier, LabelDocument, LabelNotice, LabelPrinter};
use crate::manager::{Precondition, ScanCommit, Storage};
#[cfg(feature = "metrics")]
use crate::metrics::ScanMetrics;
use crate::stats::DailyStatsAggregator;

pub mod sessions;
pub mod throttle;

use sessions::SessionRegistry;
use throttle::PinThrottle;

/// Open a scanning screen on a terminal.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub terminal_id: String,
    pub operator_id: OperatorId,
    pub branch_id: BranchId,
    pub mode: ScanMode,
}

/// Supervisor PIN submission.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub session_id: SessionId,
    pub pin: String,
    pub branch_id: BranchId,
    pub operator_id: OperatorId,
    pub tracking_code: String,
}

impl std::fmt::Debug for AuthorizeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizeRequest")
            .field("session_id", &self.session_id)
            .field("pin", &"<redacted>")
            .field("branch_id", &self.branch_id)
            .field("operator_id", &self.operator_id)
            .field("tracking_code", &self.tracking_code)
            .finish()
    }
}

/// Result of an accepted scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReceipt {
    pub event: ScanEvent,
    pub package: PackageSummary,
    /// Present when the scan produced a new outbound label
    pub label: Option<LabelNotice>,
}

pub struct ScanEngine<S: Storage, D: BranchDirectory, P: LabelPrinter> {
    storage: Arc<S>,
    directory: Arc<D>,
    notifier: LabelDispatchNotifier<P>,
    policy: Arc<dyn TransitionPolicy>,
    config: EngineConfig,
    sessions: SessionRegistry,
    throttle: PinThrottle,
    stats: Arc<DailyStatsAggregator<S>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ScanMetrics>>,
}

impl<S, D, P> ScanEngine<S, D, P>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    pub fn new(storage: Arc<S>, directory: Arc<D>, printer: P, config: EngineConfig) -> Self {
        Self {
            notifier: LabelDispatchNotifier::new(printer, config.relabel_external_express),
            throttle: PinThrottle::new(config.pin_max_failures, config.pin_failure_window()),
            stats: Arc::new(DailyStatsAggregator::new(storage.clone(), config.clone())),
            policy: Arc::new(DefaultTransitionPolicy),
            sessions: SessionRegistry::new(),
            storage,
            directory,
            config,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Replace the shipment registry's transition table.
    pub fn with_policy(mut self, policy: Arc<dyn TransitionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn stats(&self) -> &Arc<DailyStatsAggregator<S>> {
        &self.stats
    }

    pub fn notifier(&self) -> &LabelDispatchNotifier<P> {
        &self.notifier
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    #[tracing::instrument(skip(self, request), fields(terminal_id = %request.terminal_id, operator_id = %request.operator_id, branch_id = %request.branch_id))]
    pub async fn open_session(&self, request: OpenSessionRequest) -> Result<ScanSession> {
        self.verify_operator(request.operator_id, request.branch_id)
            .await?;
        let session = ScanSession::open(
            request.terminal_id,
            request.operator_id,
            request.branch_id,
            request.mode,
            Utc::now(),
        );
        let snapshot = session.clone();
        self.sessions.insert(session);
        self.observe_sessions();
        tracing::info!(session_id = %snapshot.id, mode = %snapshot.mode, "Scan session opened");
        Ok(snapshot)
    }

    /// Current state of a session.
    pub async fn session(&self, session_id: SessionId) -> Result<ScanSession> {
        let handle = self.sessions.get(session_id)?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Change scan direction. Clears the open family and cancels the gate.
    #[tracing::instrument(skip(self), fields(session_id = %session_id, mode = %mode))]
    pub async fn switch_mode(&self, session_id: SessionId, mode: ScanMode) -> Result<ScanSession> {
        let handle = self.sessions.get(session_id)?;
        let mut session = handle.lock().await;
        session.touch(Utc::now());
        if let Some(grant) = session.switch_mode(mode) {
            self.revoke(&grant).await;
        }
        Ok(session.clone())
    }

    /// Clear the session's open family. Packages are untouched.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn reset_batch(&self, session_id: SessionId) -> Result<()> {
        let handle = self.sessions.get(session_id)?;
        let mut session = handle.lock().await;
        session.touch(Utc::now());
        let previous = session.open_family.take();
        tracing::info!(previous_family = ?previous, "Batch reset");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close_session(&self, session_id: SessionId) -> Result<()> {
        let handle = self.sessions.remove(session_id)?;
        let mut session = handle.lock().await;
        if let Some(grant) = session.cancel_gate() {
            self.revoke(&grant).await;
        }
        self.observe_sessions();
        tracing::info!("Scan session closed");
        Ok(())
    }

    /// Purge sessions idle past `session_idle_timeout_secs`, revoking their grants.
    pub async fn purge_idle_sessions(&self) -> usize {
        let before = self.sessions.len();
        let grants = self
            .sessions
            .purge_idle(Utc::now(), self.config.session_idle_timeout());
        for grant in &grants {
            self.revoke(grant).await;
        }
        self.observe_sessions();
        before.saturating_sub(self.sessions.len())
    }

    // ========================================================================
    // Supervisor authorization gate
    // ========================================================================

    /// Validate a supervisor PIN and issue a single-use grant for one code.
    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id, branch_id = %request.branch_id, tracking_code = %request.tracking_code))]
    pub async fn authorize(&self, request: AuthorizeRequest) -> Result<SupervisorAuthorization> {
        let now = Utc::now();
        let code = TrackingCode::parse(&request.tracking_code);
        if !code.family().requires_supervisor() {
            return Err(ScanError::ValidationError(format!(
                "{} ({}) does not require supervisor authorization",
                code,
                code.family()
            )));
        }

        let handle = self.sessions.get(request.session_id)?;
        let mut session = handle.lock().await;
        self.verify_session(&session, request.operator_id, request.branch_id)
            .await?;
        session.touch(now);
        let branch_id = session.branch_id;

        let attempt = match self.throttle.reserve(branch_id, now) {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::warn!(error = %e, "Supervisor attempt throttled");
                self.record_authorization(branch_id, "throttled");
                return Err(e);
            }
        };

        let ttl = self.config.authorization_ttl();
        let (awaiting, stale) = session
            .take_gate()
            .lapse(now, ttl)
            .request(code.as_str(), now);
        if let Some(stale) = stale {
            self.revoke(&stale).await;
        }

        let supervisor = match self
            .directory
            .verify_supervisor_pin(branch_id, &request.pin)
            .await
        {
            Ok(supervisor) => supervisor,
            Err(e) => {
                session.gate = AnyGate::from(awaiting);
                return Err(e);
            }
        };

        let Some(supervisor_id) = supervisor else {
            attempt.failed();
            let awaiting = awaiting.reject_pin();
            tracing::warn!(
                failed_attempts = awaiting.state.failed_attempts,
                "Incorrect supervisor credential"
            );
            session.gate = AnyGate::from(awaiting);
            self.record_authorization(branch_id, "incorrect");
            return Err(ScanError::IncorrectCredential);
        };
        attempt.succeeded();

        let grant = SupervisorAuthorization::issue(
            branch_id,
            supervisor_id,
            code.as_str(),
            Some(session.id),
            now,
            ttl,
        );
        if let Err(e) = self.storage.issue_authorization(&grant).await {
            session.gate = AnyGate::from(awaiting);
            return Err(e);
        }
        session.gate = AnyGate::from(awaiting.authorize(grant.clone())?);

        self.record_authorization(branch_id, "granted");
        tracing::info!(
            supervisor_id = %supervisor_id,
            authorization_id = %grant.id,
            expires_at = %grant.expires_at,
            "Supervisor authorization granted"
        );
        Ok(grant)
    }

    /// Return the gate to `PendingScan`, revoking any unconsumed grant.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn cancel_authorization(&self, session_id: SessionId) -> Result<()> {
        let handle = self.sessions.get(session_id)?;
        let mut session = handle.lock().await;
        session.touch(Utc::now());
        if let Some(grant) = session.cancel_gate() {
            self.revoke(&grant).await;
        }
        tracing::info!("Supervisor authorization cancelled");
        Ok(())
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    /// Process one scan.
    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id, tracking_code = %request.tracking_code, scan_type = %request.scan_type, branch_id = %request.branch_id))]
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanReceipt> {
        let branch_id = request.branch_id;
        let result = self.process_scan(request).await;

        match &result {
            Ok(receipt) => {
                metrics::counter!("scan_engine_scans_total", "outcome" => "accepted").increment(1);
                self.record_accepted(branch_id, &receipt.event);
                tracing::info!(
                    package_id = %receipt.package.id,
                    family = %receipt.event.family,
                    status = %receipt.package.status,
                    "Scan accepted"
                );
            }
            Err(e) => {
                let outcome = if e.is_rejection() { "rejected" } else { "failed" };
                metrics::counter!(
                    "scan_engine_scans_total",
                    "outcome" => outcome,
                    "kind" => e.kind().as_str()
                )
                .increment(1);
                self.record_rejected(branch_id, e);
                if e.is_rejection() {
                    tracing::info!(kind = e.kind().as_str(), reason = %e, "Scan rejected");
                } else {
                    tracing::error!(error = %e, "Scan not processed");
                }
            }
        }
        result
    }

    async fn process_scan(&self, request: ScanRequest) -> Result<ScanReceipt> {
        let now = Utc::now();
        let code = TrackingCode::parse(&request.tracking_code);
        let mode = request.scan_type;

        let handle = self.sessions.get(request.session_id)?;
        let mut session = handle.lock().await;
        self.verify_session(&session, request.operator_id, request.branch_id)
            .await?;
        session.touch(now);
        if session.mode != mode {
            return Err(ScanError::ModeMismatch {
                session: session.mode,
                scanned: mode,
            });
        }

        session.check_batch(&code)?;
        let family = code.family();
        let branch_id = session.branch_id;

        let (precondition, package) = match self.storage.find_package(family, code.as_str()).await? {
            Some(existing) => (Precondition::Matches(existing.snapshot()), existing),
            None if family == TrackingFamily::ExternalExpress && mode == ScanMode::Intake => {
                let created = Package::first_contact(
                    &code,
                    &self.config.external_express_service_type,
                    now,
                );
                (Precondition::Absent, AnyPackage::from(created))
            }
            None => return Err(ScanError::NoMatchingShipment(code.to_string())),
        };

        let moved: AnyPackage = match mode {
            ScanMode::Intake => package
                .receive(branch_id, now, self.policy.as_ref())?
                .into(),
            ScanMode::Dispatch => package
                .dispatch(branch_id, now, self.policy.as_ref())?
                .into(),
        };

        let grant = if family.requires_supervisor() {
            Some(self.live_grant(&mut session, &code, now).await?)
        } else {
            None
        };

        let express_details = if family.requires_supervisor() && mode == ScanMode::Intake {
            let details = request.express_details.ok_or_else(|| {
                ScanError::ValidationError(
                    "express intake requires weight, piece count, consignee and description"
                        .to_string(),
                )
            })?;
            details.validate()?;
            Some(details)
        } else {
            None
        };

        let data = moved.data();
        let event = ScanEvent {
            id: ScanEventId::new(),
            package_id: data.id,
            tracking_number: data.tracking_number.clone(),
            family,
            scan_type: mode,
            branch_id,
            operator_id: request.operator_id,
            service_type: data.service_type.clone(),
            scanned_at: now,
            authorization_id: grant.as_ref().map(|g| g.id),
            notes: request.notes,
            express_details,
        };

        self.storage
            .commit_scan(ScanCommit {
                precondition,
                package: moved.clone(),
                event: event.clone(),
                consume_authorization: grant.as_ref().map(|g| g.id),
                business_date: self.config.business_date(now),
            })
            .await?;

        session.commit_family(family);
        if let Some(grant) = &grant {
            complete_gate(&mut session, grant);
        }
        drop(session);

        let label = self.notifier.notify(&event, moved.data()).await;
        if let Some(notice) = &label {
            self.record_label(notice.url.is_some());
        }

        Ok(ScanReceipt {
            package: PackageSummary::from(&moved),
            event,
            label,
        })
    }

    /// Find the live grant for `code`, or move the gate to `AwaitingPin`.
    ///
    /// A live grant held for a different code stays in place; the scan is
    /// rejected without touching it.
    async fn live_grant(
        &self,
        session: &mut ScanSession,
        code: &TrackingCode,
        now: chrono::DateTime<Utc>,
    ) -> Result<SupervisorAuthorization> {
        session.gate = session
            .take_gate()
            .lapse(now, self.config.authorization_ttl());

        if let Some(grant) = self
            .storage
            .find_authorization(session.branch_id, code.as_str(), now)
            .await?
        {
            return Ok(grant);
        }

        if !matches!(session.gate, AnyGate::Authorized(_)) {
            let (awaiting, _) = session.take_gate().request(code.as_str(), now);
            session.gate = AnyGate::from(awaiting);
        }
        Err(ScanError::AuthorizationRequired(code.to_string()))
    }

    // ========================================================================
    // Stats, history and labels
    // ========================================================================

    /// Counters for a branch-day; today when `date` is `None`.
    pub async fn daily_stats(
        &self,
        branch_id: BranchId,
        date: Option<NaiveDate>,
    ) -> Result<DailyStatsSnapshot> {
        let date = date.unwrap_or_else(|| self.stats.today());
        self.stats.snapshot(branch_id, date).await
    }

    /// Audit log for a branch-day; today when `date` is `None`.
    pub async fn scan_events(
        &self,
        branch_id: BranchId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<ScanEvent>> {
        let date = date.unwrap_or_else(|| self.stats.today());
        let (from, to) = self.config.business_day_window(date);
        self.storage
            .list_scan_events(ScanEventFilter {
                branch_id: Some(branch_id),
                from,
                to,
            })
            .await
    }

    /// Re-request the relabel document for a package.
    #[tracing::instrument(skip(self), fields(package_id = %package_id))]
    pub async fn reprint_label(&self, package_id: PackageId) -> Result<LabelDocument> {
        let package = self.storage.get_package(package_id).await?;
        let data = package.data();
        if !self.config.relabel_external_express
            || data.family != TrackingFamily::ExternalExpress
            || data.last_scan.is_none()
        {
            return Err(ScanError::ValidationError(format!(
                "no label was issued for package {}",
                data.tracking_number
            )));
        }
        let document = self.notifier.reprint(data).await?;
        self.record_label(true);
        Ok(document)
    }

    /// Spawn the stats rebuild loop and the idle session purge.
    pub fn spawn_background(self: Arc<Self>, shutdown_token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(handle) = self.stats.clone().spawn(shutdown_token.clone()) {
            handles.push(handle);
        }

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(StdDuration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = engine.purge_idle_sessions().await;
                        if purged > 0 {
                            tracing::info!(purged = purged, "Idle scan sessions purged");
                        }
                    }
                    _ = shutdown_token.cancelled() => {
                        tracing::info!("Shutting down session purge");
                        break;
                    }
                }
            }
        }));
        handles
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn verify_operator(&self, operator_id: OperatorId, branch_id: BranchId) -> Result<()> {
        match self.directory.branch_of(operator_id).await? {
            Some(assigned) if assigned == branch_id => Ok(()),
            _ => Err(ScanError::OperatorNotAtBranch {
                operator_id,
                branch_id,
            }),
        }
    }

    async fn verify_session(
        &self,
        session: &ScanSession,
        operator_id: OperatorId,
        branch_id: BranchId,
    ) -> Result<()> {
        if session.operator_id != operator_id || session.branch_id != branch_id {
            return Err(ScanError::OperatorNotAtBranch {
                operator_id,
                branch_id,
            });
        }
        self.verify_operator(operator_id, branch_id).await
    }

    /// Best effort: an unrevoked grant still expires on its own.
    async fn revoke(&self, grant: &SupervisorAuthorization) {
        match self.storage.revoke_authorization(grant.id).await {
            Ok(()) => tracing::debug!(authorization_id = %grant.id, "Revoked unused authorization"),
            Err(e) => tracing::warn!(
                authorization_id = %grant.id,
                error = %e,
                "Failed to revoke authorization"
            ),
        }
    }

    fn observe_sessions(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.set_open_sessions(self.sessions.len());
        }
    }

    fn record_accepted(&self, _branch_id: BranchId, _event: &ScanEvent) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_scan_accepted(_branch_id, _event.scan_type, _event.family);
        }
    }

    fn record_rejected(&self, _branch_id: BranchId, _error: &ScanError) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_scan_rejected(_branch_id, _error.kind());
        }
    }

    fn record_authorization(&self, _branch_id: BranchId, _outcome: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_authorization_attempt(_branch_id, _outcome);
        }
    }

    fn record_label(&self, _rendered: bool) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_label(_rendered);
        }
    }
}

/// Return the gate to `PendingScan` after the grant was consumed.
fn complete_gate(session: &mut ScanSession, grant: &SupervisorAuthorization) {
    session.gate = match session.take_gate() {
        AnyGate::Authorized(g) if g.state.grant.id == grant.id => AnyGate::from(g.complete()),
        AnyGate::AwaitingPin(g) if g.state.tracking_number == grant.tracking_number => {
            AnyGate::from(Gate::new(g.branch_id))
        }
        other => other,
    };
}
