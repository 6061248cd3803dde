//! Storage Module
//!
//! Narrow persistence contracts for each entity family. Two backends
//! implement all of them:
//! - `MemoryStore`: `Arc<RwLock<HashMap>>` maps, used for development and tests
//! - `PgStore`: PostgreSQL through a deadpool connection pool

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::audit::models::{AuditAggregate, AuditEvent, AuditFilter};
use crate::error::Result;
use crate::filter::models::{ContentDirection, ContentFilterRule, FilterLogEntry, FilterStatistics};
use crate::lineage::models::{LineageEdge, LineageNode};
use crate::policy::models::{Policy, PolicyStatus, PolicyViolation, ViolationFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn insert_policy(&self, policy: &Policy) -> Result<()>;

    /// Replace the canonical row. Last writer wins.
    async fn update_policy(&self, policy: &Policy) -> Result<()>;

    async fn get_policy(&self, id: Uuid) -> Result<Option<Policy>>;

    /// Ordered by `(created_at, id)`
    async fn list_policies(&self, status: Option<PolicyStatus>) -> Result<Vec<Policy>>;

    /// Returns whether a row was removed
    async fn delete_policy(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn insert_violation(&self, violation: &PolicyViolation) -> Result<()>;

    /// Newest first
    async fn list_violations(
        &self,
        filter: &ViolationFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PolicyViolation>>;
}

#[async_trait]
pub trait FilterRuleStore: Send + Sync {
    async fn insert_rule(&self, rule: &ContentFilterRule) -> Result<()>;

    async fn update_rule(&self, rule: &ContentFilterRule) -> Result<()>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<ContentFilterRule>>;

    /// All rules, priority descending then `created_at`
    async fn list_rules(&self) -> Result<Vec<ContentFilterRule>>;

    /// Enabled rules applying to `direction`, priority descending
    async fn list_enabled_rules(&self, direction: ContentDirection) -> Result<Vec<ContentFilterRule>>;

    async fn delete_rule(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait FilterLogStore: Send + Sync {
    async fn insert_filter_log(&self, entry: &FilterLogEntry) -> Result<()>;

    async fn filter_statistics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        top_rules: usize,
    ) -> Result<FilterStatistics>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a batch in one round trip
    async fn insert_events(&self, events: &[AuditEvent]) -> Result<()>;

    async fn get_event(&self, id: Uuid) -> Result<Option<AuditEvent>>;

    /// Newest first
    async fn search_events(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditEvent>>;

    async fn aggregate_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<AuditAggregate>;

    /// Copy rows older than `cutoff` into the archive, skipping ids already
    /// there; returns rows copied
    async fn copy_to_archive(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete rows older than `cutoff` whose id is present in the archive.
    /// Rows written after the copy stay in the primary table.
    async fn delete_archived_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait LineageStore: Send + Sync {
    async fn insert_node(&self, node: &LineageNode) -> Result<()>;

    async fn update_node(&self, node: &LineageNode) -> Result<()>;

    async fn get_node(&self, id: Uuid) -> Result<Option<LineageNode>>;

    async fn get_nodes(&self, ids: &[Uuid]) -> Result<Vec<LineageNode>>;

    /// Ordered by name
    async fn list_nodes(&self, offset: usize, limit: usize) -> Result<Vec<LineageNode>>;

    async fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<LineageNode>>;

    /// Delete a node's edges, then the node. Returns whether the node existed.
    async fn delete_node_cascade(&self, id: Uuid) -> Result<bool>;

    async fn insert_edge(&self, edge: &LineageEdge) -> Result<()>;

    async fn get_edge(&self, id: Uuid) -> Result<Option<LineageEdge>>;

    async fn delete_edge(&self, id: Uuid) -> Result<bool>;

    /// Edges with `source_node_id == id`
    async fn outgoing_edges(&self, id: Uuid) -> Result<Vec<LineageEdge>>;

    /// Edges with `target_node_id == id`
    async fn incoming_edges(&self, id: Uuid) -> Result<Vec<LineageEdge>>;

    /// First downstream path from `from` to `to` within `max_depth` hops
    async fn find_path(&self, from: Uuid, to: Uuid, max_depth: usize) -> Result<PathSearch>;
}

/// Outcome of a bounded downstream path search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSearch {
    Found(Vec<Uuid>),
    /// Every reachable node was visited
    NotFound,
    /// Stopped at `max_depth` with unexplored edges left
    DepthExceeded,
}

impl PathSearch {
    pub fn into_path(self) -> Option<Vec<Uuid>> {
        match self {
            PathSearch::Found(path) => Some(path),
            PathSearch::NotFound | PathSearch::DepthExceeded => None,
        }
    }
}

/// Every store contract behind one object
pub trait GovernanceStore:
    PolicyStore + ViolationStore + FilterRuleStore + FilterLogStore + AuditStore + LineageStore
{
}

impl<T> GovernanceStore for T where
    T: PolicyStore + ViolationStore + FilterRuleStore + FilterLogStore + AuditStore + LineageStore
{
}
