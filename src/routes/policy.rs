//! Policy API Routes
//!
//! Policy lifecycle, exceptions, evaluation and violation history.

use crate::error::ApiResult;
use crate::models::{MessageResponse, Page, Pagination, SuccessResponse};
use crate::policy::models::{
    CreateExceptionRequest, CreatePolicyRequest, PolicyType, UpdatePolicyRequest, ViolationFilter,
};
use crate::policy::{EvaluationRequest, Policy, PolicyDecision, PolicyStatus, PolicyViolation};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

// ==================== Request Types ====================

#[derive(Debug, Deserialize)]
pub struct PolicyListQuery {
    pub status: Option<PolicyStatus>,
    #[serde(rename = "type")]
    pub policy_type: Option<PolicyType>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationQuery {
    pub policy_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

// ==================== Handlers ====================

pub async fn create_policy(
    State(state): State<SharedState>,
    Json(req): Json<CreatePolicyRequest>,
) -> ApiResult<Json<SuccessResponse<Policy>>> {
    let policy = state.policy.create_policy(req).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Policy '{}' created as draft", policy.name),
        policy,
    )))
}

pub async fn list_policies(
    State(state): State<SharedState>,
    Query(query): Query<PolicyListQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<Policy>>>> {
    let policies = state.policy.list_policies(query.status, query.policy_type).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} policies", policies.len()),
        policies,
    )))
}

pub async fn get_policy(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<Policy>>> {
    let policy = state.policy.get_policy(id).await?;
    Ok(Json(SuccessResponse::with_data("Policy retrieved", policy)))
}

pub async fn update_policy(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdatePolicyRequest>,
) -> ApiResult<Json<SuccessResponse<Policy>>> {
    let policy = state.policy.update_policy(id, req).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Policy updated to version {}", policy.version),
        policy,
    )))
}

pub async fn delete_policy(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    state.policy.delete_policy(id).await?;
    Ok(Json(MessageResponse::new(format!("Policy {} deleted", id))))
}

pub async fn activate_policy(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<Policy>>> {
    let policy = state.policy.activate_policy(id).await?;
    Ok(Json(SuccessResponse::with_data("Policy activated", policy)))
}

pub async fn deprecate_policy(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<Policy>>> {
    let policy = state.policy.deprecate_policy(id).await?;
    Ok(Json(SuccessResponse::with_data("Policy deprecated", policy)))
}

pub async fn add_exception(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateExceptionRequest>,
) -> ApiResult<Json<SuccessResponse<Policy>>> {
    let policy = state.policy.add_exception(id, req).await?;
    Ok(Json(SuccessResponse::with_data("Exception added", policy)))
}

pub async fn remove_exception(
    State(state): State<SharedState>,
    Path((id, exception_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<SuccessResponse<Policy>>> {
    let policy = state.policy.remove_exception(id, exception_id).await?;
    Ok(Json(SuccessResponse::with_data("Exception removed", policy)))
}

/// Evaluate a request against every active policy
pub async fn evaluate(
    State(state): State<SharedState>,
    Json(req): Json<EvaluationRequest>,
) -> ApiResult<Json<SuccessResponse<PolicyDecision>>> {
    let decision = state.policy.evaluate(&req).await?;
    let message = if decision.allowed { "Allowed" } else { "Denied" };
    Ok(Json(SuccessResponse::with_data(message, decision)))
}

pub async fn list_violations(
    State(state): State<SharedState>,
    Query(query): Query<ViolationQuery>,
) -> ApiResult<Json<SuccessResponse<Page<PolicyViolation>>>> {
    let filter = ViolationFilter {
        policy_id: query.policy_id,
        user_id: query.user_id,
        ..Default::default()
    };
    let defaults = Pagination::default();
    let pagination = Pagination {
        offset: query.offset.unwrap_or(defaults.offset),
        limit: query.limit.unwrap_or(defaults.limit),
    };
    let page = state.policy.list_violations(&filter, pagination).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} violations", page.items.len()),
        page,
    )))
}
