//! Lineage graph data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Source,
    Dataset,
    Table,
    Column,
    Model,
    Pipeline,
    Report,
    Dashboard,
    Api,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Source => "source",
            NodeType::Dataset => "dataset",
            NodeType::Table => "table",
            NodeType::Column => "column",
            NodeType::Model => "model",
            NodeType::Pipeline => "pipeline",
            NodeType::Report => "report",
            NodeType::Dashboard => "dashboard",
            NodeType::Api => "api",
        }
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(NodeType::Source),
            "dataset" => Ok(NodeType::Dataset),
            "table" => Ok(NodeType::Table),
            "column" => Ok(NodeType::Column),
            "model" => Ok(NodeType::Model),
            "pipeline" => Ok(NodeType::Pipeline),
            "report" => Ok(NodeType::Report),
            "dashboard" => Ok(NodeType::Dashboard),
            "api" => Ok(NodeType::Api),
            other => Err(format!("Unknown node type '{}'", other)),
        }
    }
}

/// Where a node physically lives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSource {
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageNode {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    pub description: Option<String>,
    pub source: NodeSource,
    pub schema: Option<Vec<SchemaField>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LineageNode {
    /// Case-insensitive substring match over name, description, system and tags
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        let hit = |s: &str| s.to_lowercase().contains(&query);

        hit(&self.name)
            || self.description.as_deref().is_some_and(hit)
            || hit(&self.source.system)
            || self.tags.iter().any(|t| hit(t))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeRequest {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[validate(length(min = 1, max = 255, message = "Node name must be between 1 and 255 characters"))]
    pub name: String,
    pub description: Option<String>,
    pub source: NodeSource,
    pub schema: Option<Vec<SchemaField>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeRequest {
    #[validate(length(min = 1, max = 255, message = "Node name must be between 1 and 255 characters"))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub source: Option<NodeSource>,
    pub schema: Option<Vec<SchemaField>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    DerivedFrom,
    Transforms,
    Copies,
    Aggregates,
    Joins,
    Filters,
    TrainedOn,
    Feeds,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::DerivedFrom => "derived_from",
            EdgeType::Transforms => "transforms",
            EdgeType::Copies => "copies",
            EdgeType::Aggregates => "aggregates",
            EdgeType::Joins => "joins",
            EdgeType::Filters => "filters",
            EdgeType::TrainedOn => "trained_on",
            EdgeType::Feeds => "feeds",
        }
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "derived_from" => Ok(EdgeType::DerivedFrom),
            "transforms" => Ok(EdgeType::Transforms),
            "copies" => Ok(EdgeType::Copies),
            "aggregates" => Ok(EdgeType::Aggregates),
            "joins" => Ok(EdgeType::Joins),
            "filters" => Ok(EdgeType::Filters),
            "trained_on" => Ok(EdgeType::TrainedOn),
            "feeds" => Ok(EdgeType::Feeds),
            other => Err(format!("Unknown edge type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transformation {
    /// e.g. `sql`, `python`, `spark`
    pub kind: String,
    pub expression: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageEdge {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub transformation: Option<Transformation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEdgeRequest {
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub transformation: Option<Transformation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TraversalDirection {
    Upstream,
    Downstream,
    #[default]
    Both,
}

impl TraversalDirection {
    pub fn follows_downstream(&self) -> bool {
        matches!(self, TraversalDirection::Downstream | TraversalDirection::Both)
    }

    pub fn follows_upstream(&self) -> bool {
        matches!(self, TraversalDirection::Upstream | TraversalDirection::Both)
    }
}

/// Induced subgraph returned by traversals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageGraph {
    pub root_id: Uuid,
    pub direction: TraversalDirection,
    pub depth: usize,
    pub nodes: Vec<LineageNode>,
    pub edges: Vec<LineageEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactSeverity {
    pub fn from_affected_count(count: usize) -> Self {
        match count {
            0 => ImpactSeverity::Low,
            1..=5 => ImpactSeverity::Medium,
            6..=20 => ImpactSeverity::High,
            _ => ImpactSeverity::Critical,
        }
    }

    /// One tier up, saturating at critical
    pub fn escalate(self) -> Self {
        match self {
            ImpactSeverity::Low => ImpactSeverity::Medium,
            ImpactSeverity::Medium => ImpactSeverity::High,
            ImpactSeverity::High | ImpactSeverity::Critical => ImpactSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactAnalysis {
    pub node_id: Uuid,
    pub affected_nodes: Vec<LineageNode>,
    pub affected_count: usize,
    pub severity: ImpactSeverity,
    /// Affected nodes carrying a sensitive tag
    pub sensitive_nodes: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineagePath {
    pub source_id: Uuid,
    pub target_id: Uuid,
    /// Node ids from source to target, inclusive
    pub nodes: Vec<Uuid>,
}
