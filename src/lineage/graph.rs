//! Data Lineage Graph
//!
//! Nodes are data assets; an edge `a -> b` means `b` is derived from `a`.
//! The edge set stays acyclic: every new edge is checked against a bounded
//! path search from its target back to its source before it is inserted.
//! A search that reaches its bound with edges left to explore refuses the
//! edge.

use super::models::{
    CreateEdgeRequest, CreateNodeRequest, ImpactAnalysis, ImpactSeverity, LineageEdge,
    LineageGraph, LineageNode, LineagePath, TraversalDirection, UpdateNodeRequest,
};
use crate::audit::{AuditEventType, AuditOutcome, AuditTrail, EventDetails, RecordEventInput};
use crate::error::{validation_error, GovernanceError, Result};
use crate::models::{Actor, Page, Pagination, ResourceRef};
use crate::storage::{LineageStore, PathSearch};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Hops searched when checking a new edge for cycles
pub const CYCLE_CHECK_DEPTH: usize = 1000;

/// Hops searched by `find_path`
pub const PATH_SEARCH_DEPTH: usize = 100;

/// Largest depth accepted by `get_lineage_graph`
pub const MAX_TRAVERSAL_DEPTH: usize = 50;

/// Downstream depth used by impact analysis
pub const IMPACT_DEPTH: usize = 20;

/// Tags that escalate impact severity by one tier
pub const SENSITIVE_TAGS: [&str; 6] = ["pii", "phi", "financial", "healthcare", "compliance", "production"];

const MAX_SEARCH_RESULTS: usize = 100;

/// Accumulates a breadth-first walk
#[derive(Default)]
struct Walk {
    visited: HashSet<Uuid>,
    order: Vec<Uuid>,
    edge_ids: HashSet<Uuid>,
    edges: Vec<LineageEdge>,
}

impl Walk {
    fn visit(&mut self, id: Uuid) -> bool {
        if self.visited.insert(id) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    fn keep_edge(&mut self, edge: LineageEdge) {
        if self.edge_ids.insert(edge.id) {
            self.edges.push(edge);
        }
    }
}

pub struct LineageTracker {
    store: Arc<dyn LineageStore>,
    audit: Option<Arc<AuditTrail>>,
    /// Serializes check-then-insert for edges
    edge_lock: Mutex<()>,
    cycle_check_depth: usize,
}

impl LineageTracker {
    pub fn new(store: Arc<dyn LineageStore>) -> Self {
        Self {
            store,
            audit: None,
            edge_lock: Mutex::new(()),
            cycle_check_depth: CYCLE_CHECK_DEPTH,
        }
    }

    /// Override the hop bound of the cycle check
    pub fn with_cycle_check_depth(mut self, depth: usize) -> Self {
        self.cycle_check_depth = depth;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    pub async fn create_node(&self, request: CreateNodeRequest) -> Result<LineageNode> {
        request.validate()?;
        if request.source.system.trim().is_empty() {
            return Err(validation_error("Node source system is required"));
        }

        let now = Utc::now();
        let node = LineageNode {
            id: Uuid::new_v4(),
            node_type: request.node_type,
            name: request.name,
            description: request.description,
            source: request.source,
            schema: request.schema,
            tags: request.tags,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_node(&node).await?;
        info!("Created lineage node '{}' ({})", node.name, node.id);
        self.audit_change("create_node", "lineage_node", node.id).await;
        Ok(node)
    }

    pub async fn update_node(&self, id: Uuid, request: UpdateNodeRequest) -> Result<LineageNode> {
        request.validate()?;
        let mut node = self.get_node(id).await?;

        if let Some(name) = request.name {
            node.name = name;
        }
        if let Some(description) = request.description {
            node.description = Some(description);
        }
        if let Some(source) = request.source {
            if source.system.trim().is_empty() {
                return Err(validation_error("Node source system is required"));
            }
            node.source = source;
        }
        if let Some(schema) = request.schema {
            node.schema = Some(schema);
        }
        if let Some(tags) = request.tags {
            node.tags = tags;
        }
        node.updated_at = Utc::now();

        self.store.update_node(&node).await?;
        self.audit_change("update_node", "lineage_node", id).await;
        Ok(node)
    }

    /// Delete a node and every edge touching it
    pub async fn delete_node(&self, id: Uuid) -> Result<()> {
        let _guard = self.edge_lock.lock().await;
        if !self.store.delete_node_cascade(id).await? {
            return Err(GovernanceError::NotFound(format!("Lineage node {} not found", id)));
        }
        info!("Deleted lineage node {} and its edges", id);
        self.audit_change("delete_node", "lineage_node", id).await;
        Ok(())
    }

    pub async fn get_node(&self, id: Uuid) -> Result<LineageNode> {
        self.store
            .get_node(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("Lineage node {} not found", id)))
    }

    pub async fn list_nodes(&self, pagination: Pagination) -> Result<Page<LineageNode>> {
        let pagination = pagination.checked()?;
        let rows = self
            .store
            .list_nodes(pagination.offset, pagination.limit + 1)
            .await?;
        Ok(Page::from_overfetch(rows, pagination))
    }

    /// Substring match over name, description, system and tags
    pub async fn search_nodes(&self, query: &str, limit: Option<usize>) -> Result<Vec<LineageNode>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(validation_error("Search query is required"));
        }
        let limit = limit.unwrap_or(MAX_SEARCH_RESULTS).clamp(1, MAX_SEARCH_RESULTS);
        self.store.search_nodes(query, limit).await
    }

    // ========================================================================
    // Edges
    // ========================================================================

    pub async fn create_edge(&self, request: CreateEdgeRequest) -> Result<LineageEdge> {
        let (source, target) = (request.source_node_id, request.target_node_id);
        if source == target {
            return Err(GovernanceError::Cycle(format!(
                "Edge {} -> {} would be a self-loop",
                source, target
            )));
        }

        let _guard = self.edge_lock.lock().await;
        self.get_node(source).await?;
        self.get_node(target).await?;

        match self
            .store
            .find_path(target, source, self.cycle_check_depth)
            .await?
        {
            PathSearch::Found(path) => {
                debug!("Rejected edge {} -> {}: existing path {:?}", source, target, path);
                return Err(GovernanceError::Cycle(format!(
                    "Edge {} -> {} would close a cycle through {} nodes",
                    source,
                    target,
                    path.len()
                )));
            }
            PathSearch::DepthExceeded => {
                warn!(
                    "Rejected edge {} -> {}: cycle check exceeded {} hops",
                    source, target, self.cycle_check_depth
                );
                return Err(GovernanceError::Cycle(format!(
                    "Edge {} -> {} could not be checked for cycles within {} hops",
                    source, target, self.cycle_check_depth
                )));
            }
            PathSearch::NotFound => {}
        }

        let edge = LineageEdge {
            id: Uuid::new_v4(),
            edge_type: request.edge_type,
            source_node_id: source,
            target_node_id: target,
            transformation: request.transformation,
            created_at: Utc::now(),
        };
        self.store.insert_edge(&edge).await?;
        info!("Created lineage edge {} ({} -> {})", edge.id, source, target);
        self.audit_change("create_edge", "lineage_edge", edge.id).await;
        Ok(edge)
    }

    pub async fn get_edge(&self, id: Uuid) -> Result<LineageEdge> {
        self.store
            .get_edge(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("Lineage edge {} not found", id)))
    }

    pub async fn delete_edge(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_edge(id).await? {
            return Err(GovernanceError::NotFound(format!("Lineage edge {} not found", id)));
        }
        self.audit_change("delete_edge", "lineage_edge", id).await;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Breadth-first walk from `root`, visiting each node once
    async fn walk(&self, root: Uuid, downstream: bool, max_depth: usize, walk: &mut Walk) -> Result<()> {
        walk.visit(root);
        let mut queue: VecDeque<(Uuid, usize)> = VecDeque::from([(root, 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let edges = if downstream {
                self.store.outgoing_edges(current).await?
            } else {
                self.store.incoming_edges(current).await?
            };

            for edge in edges {
                let next = if downstream {
                    edge.target_node_id
                } else {
                    edge.source_node_id
                };
                walk.keep_edge(edge);
                if walk.visit(next) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        Ok(())
    }

    pub async fn get_lineage_graph(
        &self,
        root: Uuid,
        direction: TraversalDirection,
        depth: usize,
    ) -> Result<LineageGraph> {
        if depth > MAX_TRAVERSAL_DEPTH {
            return Err(validation_error(format!(
                "depth must be at most {}",
                MAX_TRAVERSAL_DEPTH
            )));
        }
        self.get_node(root).await?;

        let mut walk = Walk::default();
        if direction.follows_upstream() {
            self.walk(root, false, depth, &mut walk).await?;
        }
        if direction.follows_downstream() {
            self.walk(root, true, depth, &mut walk).await?;
        }

        let nodes = self.store.get_nodes(&walk.order).await?;
        debug!(
            "Lineage graph for {}: {} nodes, {} edges",
            root,
            nodes.len(),
            walk.edges.len()
        );
        Ok(LineageGraph {
            root_id: root,
            direction,
            depth,
            nodes,
            edges: walk.edges,
        })
    }

    /// Classify the downstream blast radius of a change to `id`
    pub async fn analyze_impact(&self, id: Uuid) -> Result<ImpactAnalysis> {
        self.get_node(id).await?;

        let mut walk = Walk::default();
        self.walk(id, true, IMPACT_DEPTH, &mut walk).await?;
        let affected_ids: Vec<Uuid> = walk.order.into_iter().filter(|n| *n != id).collect();
        let affected_nodes = self.store.get_nodes(&affected_ids).await?;

        let sensitive_nodes: Vec<Uuid> = affected_nodes
            .iter()
            .filter(|n| n.tags.iter().any(|t| is_sensitive(t)))
            .map(|n| n.id)
            .collect();

        let mut severity = ImpactSeverity::from_affected_count(affected_nodes.len());
        if !sensitive_nodes.is_empty() {
            severity = severity.escalate();
        }

        Ok(ImpactAnalysis {
            node_id: id,
            affected_count: affected_nodes.len(),
            affected_nodes,
            severity,
            sensitive_nodes,
        })
    }

    /// First downstream path found from `source` to `target`, not
    /// necessarily the shortest
    pub async fn find_path(&self, source: Uuid, target: Uuid) -> Result<Option<LineagePath>> {
        self.get_node(source).await?;
        self.get_node(target).await?;

        let nodes = if source == target {
            Some(vec![source])
        } else {
            self.store
                .find_path(source, target, PATH_SEARCH_DEPTH)
                .await?
                .into_path()
        };
        Ok(nodes.map(|nodes| LineagePath {
            source_id: source,
            target_id: target,
            nodes,
        }))
    }

    async fn audit_change(&self, action: &str, resource_type: &str, id: Uuid) {
        let Some(audit) = &self.audit else { return };
        audit
            .record_quietly(
                RecordEventInput::new(AuditEventType::LineageChange, Actor::system(), action)
                    .resource(ResourceRef::new(resource_type, Some(id.to_string())))
                    .outcome(AuditOutcome::Success)
                    .details(EventDetails::default()),
            )
            .await;
    }
}

fn is_sensitive(tag: &str) -> bool {
    SENSITIVE_TAGS.iter().any(|s| s.eq_ignore_ascii_case(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::models::{EdgeType, NodeSource, NodeType};
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn tracker() -> LineageTracker {
        LineageTracker::new(Arc::new(MemoryStore::new()))
    }

    fn node_request(name: &str, tags: &[&str]) -> CreateNodeRequest {
        CreateNodeRequest {
            node_type: NodeType::Table,
            name: name.to_string(),
            description: Some(format!("{} table", name)),
            source: NodeSource {
                system: "warehouse".to_string(),
                ..Default::default()
            },
            schema: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    async fn node(tracker: &LineageTracker, name: &str) -> Uuid {
        tracker.create_node(node_request(name, &[])).await.unwrap().id
    }

    fn edge_request(source: Uuid, target: Uuid) -> CreateEdgeRequest {
        CreateEdgeRequest {
            edge_type: EdgeType::DerivedFrom,
            source_node_id: source,
            target_node_id: target,
            transformation: None,
        }
    }

    async fn link(tracker: &LineageTracker, source: Uuid, target: Uuid) -> Result<LineageEdge> {
        tracker.create_edge(edge_request(source, target)).await
    }

    #[tokio::test]
    async fn test_reverse_edge_is_a_cycle() {
        let t = tracker();
        let n1 = node(&t, "n1").await;
        let n2 = node(&t, "n2").await;

        tokio_test::assert_ok!(link(&t, n1, n2).await);
        assert!(matches!(link(&t, n2, n1).await, Err(GovernanceError::Cycle(_))));
        assert!(matches!(link(&t, n1, n1).await, Err(GovernanceError::Cycle(_))));

        // Graph unchanged by the failed attempts
        let graph = t.get_lineage_graph(n1, TraversalDirection::Both, 5).await.unwrap();
        assert_eq!(graph.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_longer_cycles_rejected_and_missing_endpoints() {
        let t = tracker();
        let a = node(&t, "a").await;
        let b = node(&t, "b").await;
        let c = node(&t, "c").await;
        link(&t, a, b).await.unwrap();
        link(&t, b, c).await.unwrap();

        assert!(matches!(link(&t, c, a).await, Err(GovernanceError::Cycle(_))));
        // Diamond shapes are fine
        link(&t, a, c).await.unwrap();

        assert!(matches!(
            link(&t, a, Uuid::new_v4()).await,
            Err(GovernanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cycle_check_fails_closed_past_its_bound() {
        let t = LineageTracker::new(Arc::new(MemoryStore::new())).with_cycle_check_depth(3);
        let mut chain = Vec::new();
        for i in 0..6 {
            chain.push(node(&t, &format!("n{}", i)).await);
        }
        for pair in chain.windows(2) {
            link(&t, pair[0], pair[1]).await.unwrap();
        }

        // The path n0 -> n5 is longer than the bound
        assert!(matches!(
            link(&t, chain[5], chain[0]).await,
            Err(GovernanceError::Cycle(_))
        ));

        // An edge that cannot be proven acyclic within the bound is refused too
        let outside = node(&t, "outside").await;
        assert!(matches!(
            link(&t, outside, chain[0]).await,
            Err(GovernanceError::Cycle(_))
        ));

        // Searches that finish inside the bound behave as before
        link(&t, outside, chain[4]).await.unwrap();
        link(&t, chain[0], chain[2]).await.unwrap();
        let graph = t
            .get_lineage_graph(chain[0], TraversalDirection::Upstream, 10)
            .await
            .unwrap();
        assert_eq!(graph.edges.len(), 0);
    }

    #[tokio::test]
    async fn test_delete_node_cascades() {
        let t = tracker();
        let a = node(&t, "a").await;
        let b = node(&t, "b").await;
        let c = node(&t, "c").await;
        let ab = link(&t, a, b).await.unwrap();
        let bc = link(&t, b, c).await.unwrap();

        t.delete_node(b).await.unwrap();
        assert!(matches!(t.get_edge(ab.id).await, Err(GovernanceError::NotFound(_))));
        assert!(matches!(t.get_edge(bc.id).await, Err(GovernanceError::NotFound(_))));
        assert!(matches!(t.delete_node(b).await, Err(GovernanceError::NotFound(_))));

        // c -> a is no longer a cycle
        link(&t, c, a).await.unwrap();
    }

    #[tokio::test]
    async fn test_traversal_directions_and_depth() {
        let t = tracker();
        let raw = node(&t, "raw").await;
        let clean = node(&t, "clean").await;
        let mart = node(&t, "mart").await;
        let report = node(&t, "report").await;
        link(&t, raw, clean).await.unwrap();
        link(&t, clean, mart).await.unwrap();
        link(&t, mart, report).await.unwrap();

        let ids = |g: &LineageGraph| g.nodes.iter().map(|n| n.id).collect::<Vec<_>>();

        let down = t.get_lineage_graph(clean, TraversalDirection::Downstream, 10).await.unwrap();
        assert_eq!(ids(&down), vec![clean, mart, report]);
        assert_eq!(down.edges.len(), 2);

        let up = t.get_lineage_graph(mart, TraversalDirection::Upstream, 10).await.unwrap();
        assert_eq!(ids(&up), vec![mart, clean, raw]);

        let both = t.get_lineage_graph(clean, TraversalDirection::Both, 1).await.unwrap();
        assert_eq!(ids(&both), vec![clean, raw, mart]);
        assert_eq!(both.edges.len(), 2);

        let root_only = t.get_lineage_graph(clean, TraversalDirection::Both, 0).await.unwrap();
        assert_eq!(ids(&root_only), vec![clean]);

        assert!(t
            .get_lineage_graph(clean, TraversalDirection::Both, MAX_TRAVERSAL_DEPTH + 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_impact_severity_tiers() {
        let t = tracker();
        let root = node(&t, "root").await;

        let impact = t.analyze_impact(root).await.unwrap();
        assert_eq!(impact.severity, ImpactSeverity::Low);

        let mut last = root;
        for i in 0..5 {
            let next = node(&t, &format!("d{}", i)).await;
            link(&t, last, next).await.unwrap();
            last = next;
        }
        let impact = t.analyze_impact(root).await.unwrap();
        assert_eq!(impact.affected_count, 5);
        assert_eq!(impact.severity, ImpactSeverity::Medium);

        let fan_out = node(&t, "fan").await;
        link(&t, root, fan_out).await.unwrap();
        let impact = t.analyze_impact(root).await.unwrap();
        assert_eq!(impact.severity, ImpactSeverity::High);

        for i in 0..15 {
            let leaf = node(&t, &format!("leaf{}", i)).await;
            link(&t, fan_out, leaf).await.unwrap();
        }
        let impact = t.analyze_impact(root).await.unwrap();
        assert_eq!(impact.affected_count, 21);
        assert_eq!(impact.severity, ImpactSeverity::Critical);
    }

    #[tokio::test]
    async fn test_sensitive_tag_escalates_one_tier() {
        let t = tracker();
        let root = node(&t, "root").await;
        let billing = t
            .create_node(node_request("billing", &["Financial"]))
            .await
            .unwrap();
        link(&t, root, billing.id).await.unwrap();

        let impact = t.analyze_impact(root).await.unwrap();
        assert_eq!(impact.severity, ImpactSeverity::High);
        assert_eq!(impact.sensitive_nodes, vec![billing.id]);
    }

    #[tokio::test]
    async fn test_find_path_and_search() {
        let t = tracker();
        let a = node(&t, "orders_raw").await;
        let b = node(&t, "orders_clean").await;
        let c = t
            .create_node(node_request("revenue_dashboard", &["finance-team"]))
            .await
            .unwrap()
            .id;
        link(&t, a, b).await.unwrap();
        link(&t, b, c).await.unwrap();

        let path = t.find_path(a, c).await.unwrap().unwrap();
        assert_eq!(path.nodes, vec![a, b, c]);
        assert_eq!(t.find_path(c, a).await.unwrap(), None);

        let hits = t.search_nodes("ORDERS", None).await.unwrap();
        assert_eq!(hits.len(), 2);
        let hits = t.search_nodes("finance", None).await.unwrap();
        assert_eq!(hits.iter().map(|n| n.id).collect::<Vec<_>>(), vec![c]);
        assert!(t.search_nodes("  ", None).await.is_err());
    }

    /// Kahn's algorithm over the stored edges
    async fn is_acyclic(t: &LineageTracker, nodes: &[Uuid]) -> bool {
        let mut indegree: HashMap<Uuid, usize> = nodes.iter().map(|n| (*n, 0)).collect();
        let mut outgoing: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for n in nodes {
            for e in t.store.outgoing_edges(*n).await.unwrap() {
                *indegree.entry(e.target_node_id).or_default() += 1;
                outgoing.entry(*n).or_default().push(e.target_node_id);
            }
        }
        let mut ready: Vec<Uuid> = indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
        let mut seen = 0;
        while let Some(n) = ready.pop() {
            seen += 1;
            for m in outgoing.get(&n).into_iter().flatten() {
                let d = indegree.entry(*m).or_default();
                *d -= 1;
                if *d == 0 {
                    ready.push(*m);
                }
            }
        }
        seen == indegree.len()
    }

    proptest! {
        #[test]
        fn prop_graph_stays_acyclic(
            ops in proptest::collection::vec((0usize..6, 0usize..6, any::<bool>()), 1..40),
        ) {
            let acyclic = tokio_test::block_on(async {
                let t = tracker();
                let mut nodes = Vec::new();
                for i in 0..6 {
                    nodes.push(node(&t, &format!("n{}", i)).await);
                }
                let mut edges: Vec<Uuid> = Vec::new();

                for (from, to, delete) in ops {
                    if delete && !edges.is_empty() {
                        let victim = edges.remove(from % edges.len());
                        t.delete_edge(victim).await.unwrap();
                    } else {
                        match link(&t, nodes[from], nodes[to]).await {
                            Ok(edge) => edges.push(edge.id),
                            Err(GovernanceError::Cycle(_)) => {}
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                    if !is_acyclic(&t, &nodes).await {
                        return false;
                    }
                }
                true
            });
            prop_assert!(acyclic);
        }
    }
}
