//! Data Lineage API Routes
//!
//! Node and edge management plus graph queries: traversal, impact
//! analysis and path finding.

use crate::error::ApiResult;
use crate::lineage::models::{
    CreateEdgeRequest, CreateNodeRequest, ImpactAnalysis, LineagePath, UpdateNodeRequest,
};
use crate::lineage::{LineageEdge, LineageGraph, LineageNode, TraversalDirection};
use crate::models::{MessageResponse, Page, Pagination, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

const DEFAULT_GRAPH_DEPTH: usize = 5;

// ==================== Request Types ====================

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GraphQuery {
    #[serde(default)]
    pub direction: TraversalDirection,
    pub depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub source: Uuid,
    pub target: Uuid,
}

// ==================== Nodes ====================

pub async fn create_node(
    State(state): State<SharedState>,
    Json(req): Json<CreateNodeRequest>,
) -> ApiResult<Json<SuccessResponse<LineageNode>>> {
    let node = state.lineage.create_node(req).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Node '{}' created", node.name),
        node,
    )))
}

pub async fn list_nodes(
    State(state): State<SharedState>,
    Query(pagination): Query<Pagination>,
) -> ApiResult<Json<SuccessResponse<Page<LineageNode>>>> {
    let page = state.lineage.list_nodes(pagination).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} nodes", page.items.len()),
        page,
    )))
}

pub async fn search_nodes(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<LineageNode>>>> {
    let nodes = state.lineage.search_nodes(&query.q, query.limit).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} nodes", nodes.len()),
        nodes,
    )))
}

pub async fn get_node(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<LineageNode>>> {
    let node = state.lineage.get_node(id).await?;
    Ok(Json(SuccessResponse::with_data("Node retrieved", node)))
}

pub async fn update_node(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateNodeRequest>,
) -> ApiResult<Json<SuccessResponse<LineageNode>>> {
    let node = state.lineage.update_node(id, req).await?;
    Ok(Json(SuccessResponse::with_data("Node updated", node)))
}

pub async fn delete_node(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    state.lineage.delete_node(id).await?;
    Ok(Json(MessageResponse::new(format!(
        "Node {} and its edges deleted",
        id
    ))))
}

pub async fn get_graph(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GraphQuery>,
) -> ApiResult<Json<SuccessResponse<LineageGraph>>> {
    let depth = query.depth.unwrap_or(DEFAULT_GRAPH_DEPTH);
    let graph = state
        .lineage
        .get_lineage_graph(id, query.direction, depth)
        .await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} nodes, {} edges", graph.nodes.len(), graph.edges.len()),
        graph,
    )))
}

pub async fn analyze_impact(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ImpactAnalysis>>> {
    let impact = state.lineage.analyze_impact(id).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} downstream nodes affected", impact.affected_count),
        impact,
    )))
}

// ==================== Edges ====================

pub async fn create_edge(
    State(state): State<SharedState>,
    Json(req): Json<CreateEdgeRequest>,
) -> ApiResult<Json<SuccessResponse<LineageEdge>>> {
    let edge = state.lineage.create_edge(req).await?;
    Ok(Json(SuccessResponse::with_data("Edge created", edge)))
}

pub async fn get_edge(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<LineageEdge>>> {
    let edge = state.lineage.get_edge(id).await?;
    Ok(Json(SuccessResponse::with_data("Edge retrieved", edge)))
}

pub async fn delete_edge(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    state.lineage.delete_edge(id).await?;
    Ok(Json(MessageResponse::new(format!("Edge {} deleted", id))))
}

pub async fn find_path(
    State(state): State<SharedState>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<SuccessResponse<Option<LineagePath>>>> {
    let path = state.lineage.find_path(query.source, query.target).await?;
    let message = if path.is_some() { "Path found" } else { "No path" };
    Ok(Json(SuccessResponse::with_data(message, path)))
}
