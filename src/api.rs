//! JSON over HTTP surface for scanning terminals.
//!
//! Rejections are returned as `{accepted: false, reason, kind}` with a status that
//! reflects the category; outages map to 503 and never leak internal detail.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::BranchDirectory;
use crate::domain::scan::{PackageSummary, ScanEvent, ScanRequest};
use crate::domain::session::{ScanMode, ScanSession, SessionId};
use crate::domain::stats::DailyStatsSnapshot;
use crate::domain::{AuthorizationId, BranchId, PackageId, ScanEventId};
use crate::engine::{AuthorizeRequest, OpenSessionRequest, ScanEngine};
use crate::error::{ErrorKind, ScanError};
use crate::label::{LabelDocument, LabelPrinter, LabelReference};
use crate::manager::Storage;
#[cfg(feature = "metrics")]
use crate::metrics::ScanMetrics;

/// Shared handler state.
pub struct ApiState<S: Storage, D: BranchDirectory, P: LabelPrinter> {
    pub engine: Arc<ScanEngine<S, D, P>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Arc<ScanMetrics>>,
}

impl<S: Storage, D: BranchDirectory, P: LabelPrinter> Clone for ApiState<S, D, P> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: Storage, D: BranchDirectory, P: LabelPrinter> ApiState<S, D, P> {
    pub fn new(engine: Arc<ScanEngine<S, D, P>>) -> Self {
        Self {
            engine,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Build the terminal API router.
///
/// NOTE: Path params use `:param` syntax (axum 0.7).
pub fn router<S, D, P>(state: ApiState<S, D, P>) -> Router
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    let router = Router::new()
        .route("/sessions", post(open_session::<S, D, P>))
        .route("/sessions/:id", delete(close_session::<S, D, P>))
        .route("/sessions/:id/mode", post(switch_mode::<S, D, P>))
        .route("/scan", post(scan::<S, D, P>))
        .route("/supervisor-authorize", post(authorize::<S, D, P>))
        .route(
            "/supervisor-authorize/cancel",
            post(cancel_authorization::<S, D, P>),
        )
        .route("/batch-reset", post(reset_batch::<S, D, P>))
        .route("/daily-stats", get(daily_stats::<S, D, P>))
        .route("/scan-events", get(scan_events::<S, D, P>))
        .route("/labels/:package_id/reprint", post(reprint_label::<S, D, P>));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(render_metrics::<S, D, P>));

    router.with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub accepted: bool,
    pub reason: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Wraps [`ScanError`] for handlers.
#[derive(Debug)]
pub struct ApiError(pub ScanError);

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(error: &ScanError) -> StatusCode {
    match error {
        ScanError::AuthorizationThrottled { .. } => StatusCode::TOO_MANY_REQUESTS,
        ScanError::SessionNotFound(_) | ScanError::PackageNotFound(_) => StatusCode::NOT_FOUND,
        ScanError::OperatorNotAtBranch { .. } => StatusCode::FORBIDDEN,
        ScanError::DuplicateScan(_) => StatusCode::CONFLICT,
        _ => match error.kind() {
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Classification
            | ErrorKind::BatchMismatch
            | ErrorKind::Transition
            | ErrorKind::Session => StatusCode::UNPROCESSABLE_ENTITY,
        },
    }
}

fn retry_after(error: &ScanError) -> Option<u64> {
    match error {
        ScanError::AuthorizationThrottled {
            retry_after_secs, ..
        } => Some(*retry_after_secs),
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        if !error.is_rejection() {
            tracing::error!(error = %error, "Request failed");
        }
        let body = RejectionBody {
            accepted: false,
            reason: error.reason(),
            kind: error.kind(),
            retry_after_secs: retry_after(&error),
        };
        (status_for(&error), Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchModeBody {
    pub mode: ScanMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    pub session_id: SessionId,
}

async fn open_session<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Json(request): Json<OpenSessionRequest>,
) -> ApiResult<(StatusCode, Json<ScanSession>)>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    let session = state.engine.open_session(request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn close_session<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Path(id): Path<SessionId>,
) -> ApiResult<StatusCode>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    state.engine.close_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn switch_mode<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Path(id): Path<SessionId>,
    Json(body): Json<SwitchModeBody>,
) -> ApiResult<Json<ScanSession>>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    Ok(Json(state.engine.switch_mode(id, body.mode).await?))
}

async fn reset_batch<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Json(body): Json<SessionBody>,
) -> ApiResult<StatusCode>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    state.engine.reset_batch(body.session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Scanning
// ============================================================================

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<ScanEventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_reference: Option<LabelReference>,
}

async fn scan<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<Json<ScanResponse>>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    let receipt = state.engine.scan(request).await?;
    let (label_reference, label_url) = match receipt.label {
        Some(notice) => (Some(notice.reference), notice.url),
        None => (None, None),
    };
    Ok(Json(ScanResponse {
        accepted: true,
        event_id: Some(receipt.event.id),
        package: Some(receipt.package),
        label_url,
        label_reference,
        ..Default::default()
    }))
}

// ============================================================================
// Supervisor authorization
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<AuthorizationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

async fn authorize<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Json(request): Json<AuthorizeRequest>,
) -> (StatusCode, Json<AuthorizeResponse>)
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    match state.engine.authorize(request).await {
        Ok(grant) => (
            StatusCode::OK,
            Json(AuthorizeResponse {
                authorized: true,
                reason: None,
                kind: None,
                authorization_id: Some(grant.id),
                expires_at: Some(grant.expires_at),
                retry_after_secs: None,
            }),
        ),
        Err(e) => {
            if !e.is_rejection() {
                tracing::error!(error = %e, "Supervisor authorization failed");
            }
            (
                status_for(&e),
                Json(AuthorizeResponse {
                    authorized: false,
                    reason: Some(e.reason()),
                    kind: Some(e.kind()),
                    authorization_id: None,
                    expires_at: None,
                    retry_after_secs: retry_after(&e),
                }),
            )
        }
    }
}

async fn cancel_authorization<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Json(body): Json<SessionBody>,
) -> ApiResult<StatusCode>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    state.engine.cancel_authorization(body.session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Stats, history, labels
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDayQuery {
    pub branch_id: BranchId,
    pub date: Option<NaiveDate>,
}

async fn daily_stats<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Query(query): Query<BranchDayQuery>,
) -> ApiResult<Json<DailyStatsSnapshot>>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    let snapshot = state
        .engine
        .daily_stats(query.branch_id, query.date)
        .await?;
    Ok(Json(snapshot))
}

async fn scan_events<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Query(query): Query<BranchDayQuery>,
) -> ApiResult<Json<Vec<ScanEvent>>>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    let events = state
        .engine
        .scan_events(query.branch_id, query.date)
        .await?;
    Ok(Json(events))
}

async fn reprint_label<S, D, P>(
    State(state): State<ApiState<S, D, P>>,
    Path(package_id): Path<PackageId>,
) -> ApiResult<Json<LabelDocument>>
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    Ok(Json(state.engine.reprint_label(package_id).await?))
}

#[cfg(feature = "metrics")]
async fn render_metrics<S, D, P>(State(state): State<ApiState<S, D, P>>) -> Response
where
    S: Storage + 'static,
    D: BranchDirectory + 'static,
    P: LabelPrinter + 'static,
{
    let Some(metrics) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match metrics.render() {
        Ok(text) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}
