//! In-memory storage backend
//!
//! Each entity family lives in its own `Arc<RwLock<HashMap>>`. Good enough
//! for a single process; nothing survives a restart.

use super::{
    AuditStore, FilterLogStore, FilterRuleStore, LineageStore, PathSearch, PolicyStore,
    ViolationStore,
};
use crate::audit::models::{AuditAggregate, AuditEvent, AuditFilter};
use crate::error::{GovernanceError, Result};
use crate::filter::models::{
    ContentDirection, ContentFilterRule, FilterLogEntry, FilterStatistics, RuleHitCount,
};
use crate::lineage::models::{LineageEdge, LineageNode};
use crate::policy::models::{Policy, PolicyStatus, PolicyViolation, ViolationFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct LineageData {
    nodes: HashMap<Uuid, LineageNode>,
    edges: HashMap<Uuid, LineageEdge>,
}

/// Store for all governance entities, held in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    policies: Arc<RwLock<HashMap<Uuid, Policy>>>,
    violations: Arc<RwLock<Vec<PolicyViolation>>>,
    filter_rules: Arc<RwLock<HashMap<Uuid, ContentFilterRule>>>,
    filter_logs: Arc<RwLock<Vec<FilterLogEntry>>>,
    events: Arc<RwLock<Vec<AuditEvent>>>,
    archive: Arc<RwLock<Vec<AuditEvent>>>,
    /// Nodes and edges share one lock so cascades are atomic
    lineage: Arc<RwLock<LineageData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived audit events, oldest first
    pub async fn archived_events(&self) -> Vec<AuditEvent> {
        self.archive.read().await.clone()
    }
}

fn page<T>(rows: impl Iterator<Item = T>, offset: usize, limit: usize) -> Vec<T> {
    rows.skip(offset).take(limit).collect()
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn insert_policy(&self, policy: &Policy) -> Result<()> {
        let mut policies = self.policies.write().await;
        if policies.contains_key(&policy.id) {
            return Err(GovernanceError::Conflict(format!(
                "Policy {} already exists",
                policy.id
            )));
        }
        policies.insert(policy.id, policy.clone());
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<()> {
        let mut policies = self.policies.write().await;
        match policies.get_mut(&policy.id) {
            Some(existing) => {
                *existing = policy.clone();
                Ok(())
            }
            None => Err(GovernanceError::NotFound(format!(
                "Policy {} not found",
                policy.id
            ))),
        }
    }

    async fn get_policy(&self, id: Uuid) -> Result<Option<Policy>> {
        Ok(self.policies.read().await.get(&id).cloned())
    }

    async fn list_policies(&self, status: Option<PolicyStatus>) -> Result<Vec<Policy>> {
        let policies = self.policies.read().await;
        let mut list: Vec<Policy> = policies
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn delete_policy(&self, id: Uuid) -> Result<bool> {
        Ok(self.policies.write().await.remove(&id).is_some())
    }
}

#[async_trait]
impl ViolationStore for MemoryStore {
    async fn insert_violation(&self, violation: &PolicyViolation) -> Result<()> {
        self.violations.write().await.push(violation.clone());
        Ok(())
    }

    async fn list_violations(
        &self,
        filter: &ViolationFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PolicyViolation>> {
        let violations = self.violations.read().await;
        let mut matching: Vec<&PolicyViolation> =
            violations.iter().filter(|v| filter.matches(v)).collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(page(matching.into_iter().cloned(), offset, limit))
    }
}

fn rule_order(a: &ContentFilterRule, b: &ContentFilterRule) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[async_trait]
impl FilterRuleStore for MemoryStore {
    async fn insert_rule(&self, rule: &ContentFilterRule) -> Result<()> {
        self.filter_rules.write().await.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &ContentFilterRule) -> Result<()> {
        let mut rules = self.filter_rules.write().await;
        match rules.get_mut(&rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(GovernanceError::NotFound(format!(
                "Filter rule {} not found",
                rule.id
            ))),
        }
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<ContentFilterRule>> {
        Ok(self.filter_rules.read().await.get(&id).cloned())
    }

    async fn list_rules(&self) -> Result<Vec<ContentFilterRule>> {
        let mut rules: Vec<_> = self.filter_rules.read().await.values().cloned().collect();
        rules.sort_by(rule_order);
        Ok(rules)
    }

    async fn list_enabled_rules(&self, direction: ContentDirection) -> Result<Vec<ContentFilterRule>> {
        let mut rules: Vec<_> = self
            .filter_rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled && r.direction.applies_to(direction))
            .cloned()
            .collect();
        rules.sort_by(rule_order);
        Ok(rules)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        Ok(self.filter_rules.write().await.remove(&id).is_some())
    }
}

#[async_trait]
impl FilterLogStore for MemoryStore {
    async fn insert_filter_log(&self, entry: &FilterLogEntry) -> Result<()> {
        self.filter_logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn filter_statistics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        top_rules: usize,
    ) -> Result<FilterStatistics> {
        let logs = self.filter_logs.read().await;
        let mut stats = FilterStatistics::default();
        let mut hits: HashMap<Uuid, u64> = HashMap::new();

        for entry in logs
            .iter()
            .filter(|e| e.created_at >= since && e.created_at < until)
        {
            stats.total += 1;
            *stats.by_action.entry(entry.action.as_str().to_string()).or_default() += 1;
            if let Some(category) = entry.category {
                *stats.by_category.entry(category.as_str().to_string()).or_default() += 1;
            }
            if let Some(rule_id) = entry.rule_id {
                *hits.entry(rule_id).or_default() += 1;
            }
        }

        let mut ranked: Vec<RuleHitCount> = hits
            .into_iter()
            .map(|(rule_id, hits)| RuleHitCount { rule_id, hits })
            .collect();
        ranked.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.rule_id.cmp(&b.rule_id)));
        ranked.truncate(top_rules);
        stats.top_rules = ranked;

        Ok(stats)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_events(&self, events: &[AuditEvent]) -> Result<()> {
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<AuditEvent>> {
        Ok(self.events.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn search_events(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<&AuditEvent> = events.iter().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(page(matching.into_iter().cloned(), offset, limit))
    }

    async fn aggregate_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<AuditAggregate> {
        let events = self.events.read().await;
        let mut agg = AuditAggregate::default();

        for e in events
            .iter()
            .filter(|e| e.timestamp >= since && e.timestamp < until)
        {
            agg.total += 1;
            *agg.by_type.entry(e.event_type.as_str().to_string()).or_default() += 1;
            *agg.by_severity.entry(e.severity.as_str().to_string()).or_default() += 1;
            *agg.by_outcome.entry(e.outcome.as_str().to_string()).or_default() += 1;
            *agg.by_actor.entry(e.actor.id.clone()).or_default() += 1;
        }

        Ok(agg)
    }

    async fn copy_to_archive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let events = self.events.read().await;
        let mut archive = self.archive.write().await;
        let archived: HashSet<Uuid> = archive.iter().map(|e| e.id).collect();
        let old: Vec<AuditEvent> = events
            .iter()
            .filter(|e| e.timestamp < cutoff && !archived.contains(&e.id))
            .cloned()
            .collect();
        let copied = old.len() as u64;
        archive.extend(old);
        Ok(copied)
    }

    async fn delete_archived_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write().await;
        let archived: HashSet<Uuid> = self.archive.read().await.iter().map(|e| e.id).collect();
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff || !archived.contains(&e.id));
        Ok((before - events.len()) as u64)
    }
}

#[async_trait]
impl LineageStore for MemoryStore {
    async fn insert_node(&self, node: &LineageNode) -> Result<()> {
        self.lineage.write().await.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn update_node(&self, node: &LineageNode) -> Result<()> {
        let mut lineage = self.lineage.write().await;
        match lineage.nodes.get_mut(&node.id) {
            Some(existing) => {
                *existing = node.clone();
                Ok(())
            }
            None => Err(GovernanceError::NotFound(format!(
                "Lineage node {} not found",
                node.id
            ))),
        }
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<LineageNode>> {
        Ok(self.lineage.read().await.nodes.get(&id).cloned())
    }

    async fn get_nodes(&self, ids: &[Uuid]) -> Result<Vec<LineageNode>> {
        let lineage = self.lineage.read().await;
        Ok(ids.iter().filter_map(|id| lineage.nodes.get(id).cloned()).collect())
    }

    async fn list_nodes(&self, offset: usize, limit: usize) -> Result<Vec<LineageNode>> {
        let lineage = self.lineage.read().await;
        let mut nodes: Vec<&LineageNode> = lineage.nodes.values().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(page(nodes.into_iter().cloned(), offset, limit))
    }

    async fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<LineageNode>> {
        let lineage = self.lineage.read().await;
        let mut hits: Vec<&LineageNode> = lineage
            .nodes
            .values()
            .filter(|n| n.matches_query(query))
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(hits.into_iter().take(limit).cloned().collect())
    }

    async fn delete_node_cascade(&self, id: Uuid) -> Result<bool> {
        let mut lineage = self.lineage.write().await;
        lineage
            .edges
            .retain(|_, e| e.source_node_id != id && e.target_node_id != id);
        Ok(lineage.nodes.remove(&id).is_some())
    }

    async fn insert_edge(&self, edge: &LineageEdge) -> Result<()> {
        self.lineage.write().await.edges.insert(edge.id, edge.clone());
        Ok(())
    }

    async fn get_edge(&self, id: Uuid) -> Result<Option<LineageEdge>> {
        Ok(self.lineage.read().await.edges.get(&id).cloned())
    }

    async fn delete_edge(&self, id: Uuid) -> Result<bool> {
        Ok(self.lineage.write().await.edges.remove(&id).is_some())
    }

    async fn outgoing_edges(&self, id: Uuid) -> Result<Vec<LineageEdge>> {
        let lineage = self.lineage.read().await;
        let mut edges: Vec<LineageEdge> = lineage
            .edges
            .values()
            .filter(|e| e.source_node_id == id)
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(edges)
    }

    async fn incoming_edges(&self, id: Uuid) -> Result<Vec<LineageEdge>> {
        let lineage = self.lineage.read().await;
        let mut edges: Vec<LineageEdge> = lineage
            .edges
            .values()
            .filter(|e| e.target_node_id == id)
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(edges)
    }

    async fn find_path(&self, from: Uuid, to: Uuid, max_depth: usize) -> Result<PathSearch> {
        let lineage = self.lineage.read().await;

        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for edge in lineage.edges.values() {
            adjacency
                .entry(edge.source_node_id)
                .or_default()
                .push(edge.target_node_id);
        }

        // BFS keeping each node's predecessor to rebuild the path
        let mut parent: HashMap<Uuid, Uuid> = HashMap::new();
        let mut visited: HashSet<Uuid> = HashSet::from([from]);
        let mut queue: VecDeque<(Uuid, usize)> = VecDeque::from([(from, 0)]);
        let mut truncated = false;

        while let Some((current, depth)) = queue.pop_front() {
            if current == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(prev) = parent.get(&cursor) {
                    path.push(*prev);
                    cursor = *prev;
                }
                path.reverse();
                return Ok(PathSearch::Found(path));
            }
            if depth >= max_depth {
                truncated |= adjacency
                    .get(&current)
                    .is_some_and(|next| next.iter().any(|n| !visited.contains(n)));
                continue;
            }
            for next in adjacency.get(&current).into_iter().flatten() {
                if visited.insert(*next) {
                    parent.insert(*next, current);
                    queue.push_back((*next, depth + 1));
                }
            }
        }

        if truncated {
            Ok(PathSearch::DepthExceeded)
        } else {
            Ok(PathSearch::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::models::{AuditEventType, RecordEventInput};
    use crate::lineage::models::{EdgeType, NodeSource, NodeType};
    use crate::models::Actor;

    fn node(name: &str) -> LineageNode {
        LineageNode {
            id: Uuid::new_v4(),
            node_type: NodeType::Table,
            name: name.to_string(),
            description: None,
            source: NodeSource {
                system: "postgres".to_string(),
                ..Default::default()
            },
            schema: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn edge(from: &LineageNode, to: &LineageNode) -> LineageEdge {
        LineageEdge {
            id: Uuid::new_v4(),
            edge_type: EdgeType::Feeds,
            source_node_id: from.id,
            target_node_id: to.id,
            transformation: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_find_path_respects_depth() {
        let store = MemoryStore::new();
        let (a, b, c) = (node("a"), node("b"), node("c"));
        for n in [&a, &b, &c] {
            store.insert_node(n).await.unwrap();
        }
        store.insert_edge(&edge(&a, &b)).await.unwrap();
        store.insert_edge(&edge(&b, &c)).await.unwrap();

        assert_eq!(
            store.find_path(a.id, c.id, 5).await.unwrap(),
            PathSearch::Found(vec![a.id, b.id, c.id])
        );
        assert_eq!(
            store.find_path(a.id, c.id, 1).await.unwrap(),
            PathSearch::DepthExceeded
        );
        assert_eq!(store.find_path(c.id, a.id, 5).await.unwrap(), PathSearch::NotFound);
        // The bound is only "exceeded" when edges were left unexplored
        assert_eq!(store.find_path(b.id, a.id, 1).await.unwrap(), PathSearch::NotFound);
    }

    fn event_at(timestamp: DateTime<Utc>) -> AuditEvent {
        RecordEventInput::new(AuditEventType::DataExport, Actor::user("carol"), "export")
            .into_event(timestamp)
    }

    #[tokio::test]
    async fn test_archive_delete_keeps_rows_written_after_copy() {
        let store = MemoryStore::new();
        let cutoff = Utc::now();
        let copied = event_at(cutoff - chrono::Duration::days(2));
        store.insert_events(&[copied.clone()]).await.unwrap();

        assert_eq!(store.copy_to_archive(cutoff).await.unwrap(), 1);
        // Backdated row flushed between copy and delete
        let late = event_at(cutoff - chrono::Duration::seconds(1));
        store.insert_events(&[late.clone()]).await.unwrap();

        assert_eq!(store.delete_archived_before(cutoff).await.unwrap(), 1);
        assert!(store.get_event(late.id).await.unwrap().is_some());
        assert!(store.get_event(copied.id).await.unwrap().is_none());

        // Copying again never duplicates archived ids
        assert_eq!(store.copy_to_archive(cutoff).await.unwrap(), 1);
        assert_eq!(store.copy_to_archive(cutoff).await.unwrap(), 0);
        assert_eq!(store.archived_events().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cascade_removes_touching_edges() {
        let store = MemoryStore::new();
        let (a, b, c) = (node("a"), node("b"), node("c"));
        for n in [&a, &b, &c] {
            store.insert_node(n).await.unwrap();
        }
        store.insert_edge(&edge(&a, &b)).await.unwrap();
        store.insert_edge(&edge(&b, &c)).await.unwrap();

        assert!(store.delete_node_cascade(b.id).await.unwrap());
        assert!(store.outgoing_edges(a.id).await.unwrap().is_empty());
        assert!(store.incoming_edges(c.id).await.unwrap().is_empty());
        assert!(!store.delete_node_cascade(b.id).await.unwrap());
    }
}
