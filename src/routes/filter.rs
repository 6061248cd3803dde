//! Content Filter API Routes

use super::WindowQuery;
use crate::error::ApiResult;
use crate::filter::models::{
    ContentFilterRule, CreateFilterRuleRequest, FilterStatistics, UpdateFilterRuleRequest,
};
use crate::filter::{FilterRequest, FilterResult};
use crate::models::{MessageResponse, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;

pub async fn create_rule(
    State(state): State<SharedState>,
    Json(req): Json<CreateFilterRuleRequest>,
) -> ApiResult<Json<SuccessResponse<ContentFilterRule>>> {
    let rule = state.filter.create_rule(req).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Filter rule '{}' created", rule.name),
        rule,
    )))
}

pub async fn list_rules(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<Vec<ContentFilterRule>>>> {
    let rules = state.filter.list_rules().await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} filter rules", rules.len()),
        rules,
    )))
}

pub async fn get_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ContentFilterRule>>> {
    let rule = state.filter.get_rule(id).await?;
    Ok(Json(SuccessResponse::with_data("Filter rule retrieved", rule)))
}

pub async fn update_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateFilterRuleRequest>,
) -> ApiResult<Json<SuccessResponse<ContentFilterRule>>> {
    let rule = state.filter.update_rule(id, req).await?;
    Ok(Json(SuccessResponse::with_data("Filter rule updated", rule)))
}

pub async fn enable_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ContentFilterRule>>> {
    let rule = state.filter.set_enabled(id, true).await?;
    Ok(Json(SuccessResponse::with_data("Filter rule enabled", rule)))
}

pub async fn disable_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ContentFilterRule>>> {
    let rule = state.filter.set_enabled(id, false).await?;
    Ok(Json(SuccessResponse::with_data("Filter rule disabled", rule)))
}

pub async fn delete_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    state.filter.delete_rule(id).await?;
    Ok(Json(MessageResponse::new(format!("Filter rule {} deleted", id))))
}

/// Scan text and return the strictest decision
pub async fn check_content(
    State(state): State<SharedState>,
    Json(req): Json<FilterRequest>,
) -> ApiResult<Json<SuccessResponse<FilterResult>>> {
    let result = state.filter.filter_content(&req).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Content {}", result.action),
        result,
    )))
}

pub async fn get_statistics(
    State(state): State<SharedState>,
    Query(window): Query<WindowQuery>,
) -> ApiResult<Json<SuccessResponse<FilterStatistics>>> {
    let (since, until) = window.resolve();
    let stats = state.filter.get_statistics(since, until).await?;
    Ok(Json(SuccessResponse::with_data("Filter statistics", stats)))
}
