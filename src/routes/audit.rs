//! Audit Trail API Routes

use super::WindowQuery;
use crate::audit::models::{Anomaly, ArchiveReport, AuditSearchRequest, AuditStatistics};
use crate::audit::{AuditEvent, RecordEventInput};
use crate::error::ApiResult;
use crate::models::{Page, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    pub cutoff: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushResult {
    pub flushed: usize,
}

pub async fn record_event(
    State(state): State<SharedState>,
    Json(req): Json<RecordEventInput>,
) -> ApiResult<Json<SuccessResponse<AuditEvent>>> {
    let event = state.audit.record_event(req).await?;
    Ok(Json(SuccessResponse::with_data("Event recorded", event)))
}

pub async fn record_events(
    State(state): State<SharedState>,
    Json(req): Json<Vec<RecordEventInput>>,
) -> ApiResult<Json<SuccessResponse<Vec<AuditEvent>>>> {
    let events = state.audit.record_events(req).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} events recorded", events.len()),
        events,
    )))
}

pub async fn get_event(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<AuditEvent>>> {
    let event = state.audit.get_event(id).await?;
    Ok(Json(SuccessResponse::with_data("Event retrieved", event)))
}

pub async fn search_events(
    State(state): State<SharedState>,
    Json(req): Json<AuditSearchRequest>,
) -> ApiResult<Json<SuccessResponse<Page<AuditEvent>>>> {
    let page = state.audit.search_events(&req.filter, req.pagination).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} events", page.items.len()),
        page,
    )))
}

pub async fn get_statistics(
    State(state): State<SharedState>,
    Query(window): Query<WindowQuery>,
) -> ApiResult<Json<SuccessResponse<AuditStatistics>>> {
    let (since, until) = window.resolve();
    let stats = state.audit.get_statistics(since, until).await?;
    Ok(Json(SuccessResponse::with_data("Audit statistics", stats)))
}

pub async fn detect_anomalies(
    State(state): State<SharedState>,
    Query(window): Query<WindowQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<Anomaly>>>> {
    let (since, until) = window.resolve();
    let anomalies = state.audit.detect_anomalies(since, until).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} anomalies detected", anomalies.len()),
        anomalies,
    )))
}

pub async fn archive_events(
    State(state): State<SharedState>,
    Json(req): Json<ArchiveRequest>,
) -> ApiResult<Json<SuccessResponse<ArchiveReport>>> {
    let report = state.audit.archive_events(req.cutoff).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} events archived", report.archived),
        report,
    )))
}

/// Force the buffer to write everything pending
pub async fn flush(State(state): State<SharedState>) -> ApiResult<Json<SuccessResponse<FlushResult>>> {
    let flushed = state.audit.flush().await?;
    Ok(Json(SuccessResponse::with_data(
        "Audit buffer flushed",
        FlushResult { flushed },
    )))
}
