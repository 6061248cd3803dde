//! PostgreSQL storage backend
//!
//! Entities are stored whole as JSONB `body` columns, with the fields that
//! queries filter or sort on duplicated into plain indexed columns.

use super::{
    AuditStore, FilterLogStore, FilterRuleStore, LineageStore, PathSearch, PolicyStore,
    ViolationStore,
};
use crate::audit::models::{AuditAggregate, AuditEvent, AuditFilter};
use crate::config::DatabaseConfig;
use crate::error::{GovernanceError, Result};
use crate::filter::models::{
    ContentDirection, ContentFilterRule, FilterLogEntry, FilterStatistics, RuleHitCount,
};
use crate::lineage::models::{LineageEdge, LineageNode};
use crate::policy::models::{Policy, PolicyStatus, PolicyViolation, ViolationFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use postgres_types::{Json, ToSql};
use std::collections::{HashMap, HashSet};
use tokio_postgres::Row;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS policies (
        id UUID PRIMARY KEY,
        status VARCHAR(20) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS policy_violations (
        id UUID PRIMARY KEY,
        policy_id UUID NOT NULL,
        user_id TEXT NOT NULL,
        violation_type VARCHAR(20) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_policy_violations_timestamp ON policy_violations(timestamp DESC)",
    "CREATE TABLE IF NOT EXISTS filter_rules (
        id UUID PRIMARY KEY,
        direction VARCHAR(10) NOT NULL,
        enabled BOOLEAN NOT NULL,
        priority INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS filter_logs (
        id UUID PRIMARY KEY,
        rule_id UUID,
        category VARCHAR(30),
        action VARCHAR(20) NOT NULL,
        direction VARCHAR(10) NOT NULL,
        actor_id TEXT,
        confidence DOUBLE PRECISION NOT NULL,
        match_count INTEGER NOT NULL,
        content_hash CHAR(64) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_filter_logs_created_at ON filter_logs(created_at)",
    "CREATE TABLE IF NOT EXISTS audit_events (
        id UUID PRIMARY KEY,
        event_type VARCHAR(40) NOT NULL,
        severity VARCHAR(10) NOT NULL,
        actor_id TEXT NOT NULL,
        actor_type TEXT NOT NULL,
        resource_type TEXT,
        resource_id TEXT,
        outcome VARCHAR(10) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        search_text TEXT NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_timestamp ON audit_events(timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_actor ON audit_events(actor_id)",
    "CREATE TABLE IF NOT EXISTS audit_events_archive (LIKE audit_events INCLUDING ALL)",
    "CREATE TABLE IF NOT EXISTS lineage_nodes (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        search_text TEXT NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS lineage_edges (
        id UUID PRIMARY KEY,
        source_node_id UUID NOT NULL REFERENCES lineage_nodes(id),
        target_node_id UUID NOT NULL REFERENCES lineage_nodes(id),
        created_at TIMESTAMPTZ NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_lineage_edges_source ON lineage_edges(source_node_id)",
    "CREATE INDEX IF NOT EXISTS idx_lineage_edges_target ON lineage_edges(target_node_id)",
];

const AUDIT_COLUMNS: usize = 11;

/// Most audit rows one INSERT can carry within the 65535 bind-parameter limit
pub const MAX_INSERT_BATCH: usize = u16::MAX as usize / AUDIT_COLUMNS;

type Param = Box<dyn ToSql + Sync + Send>;

/// Accumulates `AND`-joined conditions with numbered placeholders
#[derive(Default)]
struct WhereClause {
    conditions: Vec<String>,
    params: Vec<Param>,
}

impl WhereClause {
    /// `template` uses `{}` where the placeholder goes
    fn push(&mut self, template: &str, value: Param) {
        self.params.push(value);
        let placeholder = format!("${}", self.params.len());
        self.conditions.push(template.replace("{}", &placeholder));
    }

    fn bind(&mut self, value: Param) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    fn sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

/// Escape `LIKE` wildcards in user input
fn like_pattern(query: &str) -> String {
    let escaped = query
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn body<T>(row: &Row) -> Result<T>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let Json(value): Json<T> = row.try_get("body")?;
    Ok(value)
}

fn node_search_text(node: &LineageNode) -> String {
    format!(
        "{} {} {} {}",
        node.name,
        node.description.as_deref().unwrap_or_default(),
        node.source.system,
        node.tags.join(" ")
    )
    .to_lowercase()
}

fn count(n: i64) -> u64 {
    n.max(0) as u64
}

/// Relational store over a deadpool connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool, verify it with a round trip and create missing tables
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::create_pool(config)?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        drop(client);
        info!(
            "Database connection established ({}:{}/{}, TLS: {})",
            config.host, config.port, config.database, config.require_tls
        );

        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    fn create_pool(config: &DatabaseConfig) -> Result<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

        if config.require_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

            cfg.create_pool(Some(Runtime::Tokio1), tls)
                .map_err(|e| GovernanceError::Config(format!("Failed to create TLS pool: {}", e)))
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
                .map_err(|e| GovernanceError::Config(format!("Failed to create pool: {}", e)))
        }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        for statement in SCHEMA {
            client.execute(*statement, &[]).await?;
        }
        info!("Governance tables initialized");
        Ok(())
    }
}

// ============================================================================
// Policies
// ============================================================================

#[async_trait]
impl PolicyStore for PgStore {
    async fn insert_policy(&self, policy: &Policy) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO policies (id, status, created_at, body) VALUES ($1, $2, $3, $4)",
                &[&policy.id, &policy.status.as_str(), &policy.created_at, &Json(policy)],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("unique constraint") {
                    GovernanceError::Conflict(format!("Policy {} already exists", policy.id))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE policies SET status = $2, body = $3 WHERE id = $1",
                &[&policy.id, &policy.status.as_str(), &Json(policy)],
            )
            .await?;
        if updated == 0 {
            return Err(GovernanceError::NotFound(format!("Policy {} not found", policy.id)));
        }
        Ok(())
    }

    async fn get_policy(&self, id: Uuid) -> Result<Option<Policy>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT body FROM policies WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn list_policies(&self, status: Option<PolicyStatus>) -> Result<Vec<Policy>> {
        let client = self.pool.get().await?;
        let rows = match status {
            Some(status) => {
                client
                    .query(
                        "SELECT body FROM policies WHERE status = $1 ORDER BY created_at, id",
                        &[&status.as_str()],
                    )
                    .await?
            }
            None => {
                client
                    .query("SELECT body FROM policies ORDER BY created_at, id", &[])
                    .await?
            }
        };
        rows.iter().map(body).collect()
    }

    async fn delete_policy(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM policies WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl ViolationStore for PgStore {
    async fn insert_violation(&self, violation: &PolicyViolation) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO policy_violations (id, policy_id, user_id, violation_type, timestamp, body)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &violation.id,
                    &violation.policy_id,
                    &violation.user_id,
                    &violation.violation_type.as_str(),
                    &violation.timestamp,
                    &Json(violation),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_violations(
        &self,
        filter: &ViolationFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PolicyViolation>> {
        let mut clause = WhereClause::default();
        if let Some(policy_id) = filter.policy_id {
            clause.push("policy_id = {}", Box::new(policy_id));
        }
        if let Some(user_id) = &filter.user_id {
            clause.push("user_id = {}", Box::new(user_id.clone()));
        }
        if let Some(violation_type) = filter.violation_type {
            clause.push("violation_type = {}", Box::new(violation_type.as_str()));
        }
        if let Some(since) = filter.since {
            clause.push("timestamp >= {}", Box::new(since));
        }
        if let Some(until) = filter.until {
            clause.push("timestamp < {}", Box::new(until));
        }
        let limit_at = clause.bind(Box::new(limit as i64));
        let offset_at = clause.bind(Box::new(offset as i64));

        let sql = format!(
            "SELECT body FROM policy_violations {} ORDER BY timestamp DESC, id LIMIT {} OFFSET {}",
            clause.sql(),
            limit_at,
            offset_at
        );
        let client = self.pool.get().await?;
        let rows = client.query(sql.as_str(), &clause.refs()).await?;
        rows.iter().map(body).collect()
    }
}

// ============================================================================
// Content filter
// ============================================================================

#[async_trait]
impl FilterRuleStore for PgStore {
    async fn insert_rule(&self, rule: &ContentFilterRule) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO filter_rules (id, direction, enabled, priority, created_at, body)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &rule.id,
                    &rule.direction.as_str(),
                    &rule.enabled,
                    &rule.priority,
                    &rule.created_at,
                    &Json(rule),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_rule(&self, rule: &ContentFilterRule) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE filter_rules SET direction = $2, enabled = $3, priority = $4, body = $5
                 WHERE id = $1",
                &[
                    &rule.id,
                    &rule.direction.as_str(),
                    &rule.enabled,
                    &rule.priority,
                    &Json(rule),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(GovernanceError::NotFound(format!("Filter rule {} not found", rule.id)));
        }
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<ContentFilterRule>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT body FROM filter_rules WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn list_rules(&self) -> Result<Vec<ContentFilterRule>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT body FROM filter_rules ORDER BY priority DESC, created_at, id",
                &[],
            )
            .await?;
        rows.iter().map(body).collect()
    }

    async fn list_enabled_rules(&self, direction: ContentDirection) -> Result<Vec<ContentFilterRule>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT body FROM filter_rules
                 WHERE enabled AND direction IN ($1, 'both')
                 ORDER BY priority DESC, created_at, id",
                &[&direction.as_str()],
            )
            .await?;
        rows.iter().map(body).collect()
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM filter_rules WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl FilterLogStore for PgStore {
    async fn insert_filter_log(&self, entry: &FilterLogEntry) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO filter_logs (id, rule_id, category, action, direction, actor_id,
                                          confidence, match_count, content_hash, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &entry.id,
                    &entry.rule_id,
                    &entry.category.map(|c| c.as_str()),
                    &entry.action.as_str(),
                    &entry.direction.as_str(),
                    &entry.actor_id,
                    &entry.confidence,
                    &(entry.match_count as i32),
                    &entry.content_hash,
                    &entry.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn filter_statistics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        top_rules: usize,
    ) -> Result<FilterStatistics> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT action, category, rule_id, COUNT(*) AS n FROM filter_logs
                 WHERE created_at >= $1 AND created_at < $2
                 GROUP BY action, category, rule_id",
                &[&since, &until],
            )
            .await?;

        let mut stats = FilterStatistics::default();
        let mut hits: HashMap<Uuid, u64> = HashMap::new();
        for row in &rows {
            let n = count(row.try_get("n")?);
            let action: String = row.try_get("action")?;
            let category: Option<String> = row.try_get("category")?;
            let rule_id: Option<Uuid> = row.try_get("rule_id")?;

            stats.total += n;
            *stats.by_action.entry(action).or_default() += n;
            if let Some(category) = category {
                *stats.by_category.entry(category).or_default() += n;
            }
            if let Some(rule_id) = rule_id {
                *hits.entry(rule_id).or_default() += n;
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

// ============================================================================
// Audit trail
// ============================================================================

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_events(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let client = self.pool.get().await?;
        for chunk in events.chunks(MAX_INSERT_BATCH) {
            let (sql, params) = audit_insert(chunk)?;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let inserted = client.execute(sql.as_str(), &refs).await?;
            debug!("Inserted {} audit events", inserted);
        }
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<AuditEvent>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT body FROM audit_events WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn search_events(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let mut clause = WhereClause::default();
        if let Some(event_type) = filter.event_type {
            clause.push("event_type = {}", Box::new(event_type.as_str()));
        }
        if let Some(severity) = filter.severity {
            clause.push("severity = {}", Box::new(severity.as_str()));
        }
        if let Some(actor_id) = &filter.actor_id {
            clause.push("actor_id = {}", Box::new(actor_id.clone()));
        }
        if let Some(actor_type) = &filter.actor_type {
            clause.push("actor_type = {}", Box::new(actor_type.clone()));
        }
        if let Some(resource_type) = &filter.resource_type {
            clause.push("resource_type = {}", Box::new(resource_type.clone()));
        }
        if let Some(resource_id) = &filter.resource_id {
            clause.push("resource_id = {}", Box::new(resource_id.clone()));
        }
        if let Some(outcome) = filter.outcome {
            clause.push("outcome = {}", Box::new(outcome.as_str()));
        }
        if let Some(since) = filter.since {
            clause.push("timestamp >= {}", Box::new(since));
        }
        if let Some(until) = filter.until {
            clause.push("timestamp < {}", Box::new(until));
        }
        if let Some(search) = &filter.search {
            clause.push("search_text LIKE {}", Box::new(like_pattern(search)));
        }
        let limit_at = clause.bind(Box::new(limit as i64));
        let offset_at = clause.bind(Box::new(offset as i64));

        let sql = format!(
            "SELECT body FROM audit_events {} ORDER BY timestamp DESC, id LIMIT {} OFFSET {}",
            clause.sql(),
            limit_at,
            offset_at
        );
        let client = self.pool.get().await?;
        let rows = client.query(sql.as_str(), &clause.refs()).await?;
        rows.iter().map(body).collect()
    }

    async fn aggregate_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<AuditAggregate> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT event_type, severity, outcome, actor_id, COUNT(*) AS n FROM audit_events
                 WHERE timestamp >= $1 AND timestamp < $2
                 GROUP BY event_type, severity, outcome, actor_id",
                &[&since, &until],
            )
            .await?;

        let mut agg = AuditAggregate::default();
        for row in &rows {
            let n = count(row.try_get("n")?);
            agg.total += n;
            *agg.by_type.entry(row.try_get("event_type")?).or_default() += n;
            *agg.by_severity.entry(row.try_get("severity")?).or_default() += n;
            *agg.by_outcome.entry(row.try_get("outcome")?).or_default() += n;
            *agg.by_actor.entry(row.try_get("actor_id")?).or_default() += n;
        }
        Ok(agg)
    }

    async fn copy_to_archive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let copied = client
            .execute(
                "INSERT INTO audit_events_archive
                 SELECT * FROM audit_events WHERE timestamp < $1
                 ON CONFLICT (id) DO NOTHING",
                &[&cutoff],
            )
            .await?;
        Ok(copied)
    }

    async fn delete_archived_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM audit_events a
                 WHERE a.timestamp < $1
                   AND EXISTS (SELECT 1 FROM audit_events_archive x WHERE x.id = a.id)",
                &[&cutoff],
            )
            .await?;
        Ok(deleted)
    }
}

/// Multi-row INSERT for one chunk of events
fn audit_insert(events: &[AuditEvent]) -> Result<(String, Vec<Param>)> {
    let mut params: Vec<Param> = Vec::with_capacity(events.len() * AUDIT_COLUMNS);
    let mut rows = Vec::with_capacity(events.len());
    for (i, event) in events.iter().enumerate() {
        let base = i * AUDIT_COLUMNS;
        let placeholders: Vec<String> =
            (1..=AUDIT_COLUMNS).map(|c| format!("${}", base + c)).collect();
        rows.push(format!("({})", placeholders.join(", ")));

        params.push(Box::new(event.id));
        params.push(Box::new(event.event_type.as_str()));
        params.push(Box::new(event.severity.as_str()));
        params.push(Box::new(event.actor.id.clone()));
        params.push(Box::new(event.actor.actor_type.clone()));
        params.push(Box::new(event.resource.as_ref().map(|r| r.resource_type.clone())));
        params.push(Box::new(event.resource.as_ref().and_then(|r| r.id.clone())));
        params.push(Box::new(event.outcome.as_str()));
        params.push(Box::new(event.timestamp));
        params.push(Box::new(event.search_text()));
        params.push(Box::new(Json(serde_json::to_value(event)?)));
    }

    let sql = format!(
        "INSERT INTO audit_events (id, event_type, severity, actor_id, actor_type,
                                   resource_type, resource_id, outcome, timestamp,
                                   search_text, body)
         VALUES {}
         ON CONFLICT (id) DO NOTHING",
        rows.join(", ")
    );
    Ok((sql, params))
}

// ============================================================================
// Lineage
// ============================================================================

#[async_trait]
impl LineageStore for PgStore {
    async fn insert_node(&self, node: &LineageNode) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO lineage_nodes (id, name, search_text, body) VALUES ($1, $2, $3, $4)",
                &[&node.id, &node.name, &node_search_text(node), &Json(node)],
            )
            .await?;
        Ok(())
    }

    async fn update_node(&self, node: &LineageNode) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE lineage_nodes SET name = $2, search_text = $3, body = $4 WHERE id = $1",
                &[&node.id, &node.name, &node_search_text(node), &Json(node)],
            )
            .await?;
        if updated == 0 {
            return Err(GovernanceError::NotFound(format!("Lineage node {} not found", node.id)));
        }
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<LineageNode>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT body FROM lineage_nodes WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn get_nodes(&self, ids: &[Uuid]) -> Result<Vec<LineageNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT body FROM lineage_nodes WHERE id = ANY($1)", &[&ids])
            .await?;

        let mut by_id: HashMap<Uuid, LineageNode> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let node: LineageNode = body(row)?;
            by_id.insert(node.id, node);
        }
        // Keep the caller's order
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn list_nodes(&self, offset: usize, limit: usize) -> Result<Vec<LineageNode>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT body FROM lineage_nodes ORDER BY name, id LIMIT $1 OFFSET $2",
                &[&(limit as i64), &(offset as i64)],
            )
            .await?;
        rows.iter().map(body).collect()
    }

    async fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<LineageNode>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT body FROM lineage_nodes WHERE search_text LIKE $1
                 ORDER BY name, id LIMIT $2",
                &[&like_pattern(query), &(limit as i64)],
            )
            .await?;
        rows.iter().map(body).collect()
    }

    async fn delete_node_cascade(&self, id: Uuid) -> Result<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let edges = tx
            .execute(
                "DELETE FROM lineage_edges WHERE source_node_id = $1 OR target_node_id = $1",
                &[&id],
            )
            .await?;
        let nodes = tx
            .execute("DELETE FROM lineage_nodes WHERE id = $1", &[&id])
            .await?;
        tx.commit().await?;
        debug!("Deleted node {} ({} edges)", id, edges);
        Ok(nodes > 0)
    }

    async fn insert_edge(&self, edge: &LineageEdge) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO lineage_edges (id, source_node_id, target_node_id, created_at, body)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &edge.id,
                    &edge.source_node_id,
                    &edge.target_node_id,
                    &edge.created_at,
                    &Json(edge),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_edge(&self, id: Uuid) -> Result<Option<LineageEdge>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT body FROM lineage_edges WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(body).transpose()
    }

    async fn delete_edge(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM lineage_edges WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }

    async fn outgoing_edges(&self, id: Uuid) -> Result<Vec<LineageEdge>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT body FROM lineage_edges WHERE source_node_id = $1
                 ORDER BY created_at, id",
                &[&id],
            )
            .await?;
        rows.iter().map(body).collect()
    }

    async fn incoming_edges(&self, id: Uuid) -> Result<Vec<LineageEdge>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT body FROM lineage_edges WHERE target_node_id = $1
                 ORDER BY created_at, id",
                &[&id],
            )
            .await?;
        rows.iter().map(body).collect()
    }

    /// Level-by-level BFS, one query per level
    async fn find_path(&self, from: Uuid, to: Uuid, max_depth: usize) -> Result<PathSearch> {
        let client = self.pool.get().await?;
        let mut parents: HashMap<Uuid, Uuid> = HashMap::new();
        let mut visited: HashSet<Uuid> = HashSet::from([from]);
        let mut frontier = vec![from];

        for _ in 0..max_depth {
            if frontier.is_empty() {
                break;
            }
            let rows = client
                .query(
                    "SELECT source_node_id, target_node_id FROM lineage_edges
                     WHERE source_node_id = ANY($1)",
                    &[&frontier],
                )
                .await?;

            let mut next = Vec::new();
            for row in &rows {
                let source: Uuid = row.try_get("source_node_id")?;
                let target: Uuid = row.try_get("target_node_id")?;
                if !visited.insert(target) {
                    continue;
                }
                parents.insert(target, source);
                if target == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(parent) = parents.get(&cursor) {
                        path.push(*parent);
                        cursor = *parent;
                    }
                    path.reverse();
                    return Ok(PathSearch::Found(path));
                }
                next.push(target);
            }
            frontier = next;
        }

        if frontier.is_empty() {
            return Ok(PathSearch::NotFound);
        }
        // Depth cap reached; anything still reachable from the frontier is unexplored
        let row = client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM lineage_edges
                     WHERE source_node_id = ANY($1) AND NOT (target_node_id = ANY($2))
                 )",
                &[&frontier, &visited.iter().copied().collect::<Vec<Uuid>>()],
            )
            .await?;
        if row.try_get::<_, bool>(0)? {
            Ok(PathSearch::DepthExceeded)
        } else {
            Ok(PathSearch::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_clause_numbers_placeholders() {
        let mut clause = WhereClause::default();
        clause.push("actor_id = {}", Box::new("u-1".to_string()));
        clause.push("timestamp >= {}", Box::new(Utc::now()));
        let limit = clause.bind(Box::new(10i64));

        assert_eq!(clause.sql(), "WHERE actor_id = $1 AND timestamp >= $2");
        assert_eq!(limit, "$3");
        assert_eq!(clause.refs().len(), 3);
        assert_eq!(WhereClause::default().sql(), "");
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("Orders"), "%orders%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }
    #[test]
    fn test_audit_insert_stays_within_bind_limit() {
        use crate::audit::models::{AuditEventType, RecordEventInput};
        use crate::models::Actor;

        let event = RecordEventInput::new(AuditEventType::SystemEvent, Actor::system(), "tick")
            .into_event(Utc::now());
        let events = vec![event; MAX_INSERT_BATCH + 1];

        let chunks: Vec<&[AuditEvent]> = events.chunks(MAX_INSERT_BATCH).collect();
        assert_eq!(chunks.len(), 2);
        let (sql, params) = audit_insert(chunks[0]).unwrap();
        assert!(params.len() <= u16::MAX as usize);
        assert!(sql.contains(&format!("${}", params.len())));
        assert_eq!(audit_insert(chunks[1]).unwrap().1.len(), AUDIT_COLUMNS);
    }
}
