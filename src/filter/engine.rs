//! Content Filter
//!
//! Scans text against enabled rules for its direction, resolves the
//! strongest action across every matching rule and the optional moderation
//! signal, and redacts when the final action is `redact`.

use super::detectors::detect_pii;
use super::moderation::ModerationClient;
use super::models::{
    ContentDirection, ContentFilterRule, CreateFilterRuleRequest, FilterAction, FilterCategory,
    FilterLogEntry, FilterMatch, FilterRequest, FilterResult, FilterStatistics, ModerationSignal,
    RedactionConfig, RuleConditions, UpdateFilterRuleRequest,
};
use super::redaction::{redact, RedactionSpan};
use crate::audit::{
    AuditEventType, AuditOutcome, AuditSeverity, AuditTrail, EventDetails, RecordEventInput,
};
use crate::cache::{Cache, ReadCache, SharedRows};
use crate::error::{validation_error, GovernanceError, Result};
use crate::models::{Actor, ResourceRef};
use crate::storage::{FilterLogStore, FilterRuleStore};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

const TOP_RULES: usize = 10;

/// A rule with its patterns and keywords compiled once
struct CompiledRule {
    rule: ContentFilterRule,
    /// (source, compiled) for patterns then keywords
    matchers: Vec<(String, Regex)>,
}

impl CompiledRule {
    fn compile(rule: ContentFilterRule) -> Self {
        let mut matchers = Vec::new();

        for pattern in &rule.conditions.patterns {
            match Regex::new(pattern) {
                Ok(regex) => matchers.push((pattern.clone(), regex)),
                Err(e) => warn!(
                    "Skipping invalid pattern '{}' in filter rule {}: {}",
                    pattern, rule.id, e
                ),
            }
        }

        for keyword in rule.conditions.keywords.iter().filter(|k| !k.is_empty()) {
            match keyword_regex(keyword) {
                Ok(regex) => matchers.push((keyword.clone(), regex)),
                Err(e) => warn!("Skipping keyword '{}' in filter rule {}: {}", keyword, rule.id, e),
            }
        }

        Self { rule, matchers }
    }

    fn is_exempt(&self, request: &FilterRequest) -> bool {
        let exceptions = &self.rule.exceptions;
        request
            .actor_id
            .as_ref()
            .is_some_and(|actor| exceptions.users.contains(actor))
            || exceptions
                .contexts
                .iter()
                .any(|key| request.context.contains_key(key))
    }

    fn scan(&self, text: &str) -> Vec<FilterMatch> {
        let mut matches = Vec::new();
        let mut record = |pattern: String, start: usize, end: usize| {
            matches.push(FilterMatch {
                rule_id: self.rule.id,
                pattern,
                start,
                end,
                matched_text: text[start..end].to_string(),
            });
        };

        for (source, regex) in &self.matchers {
            for m in regex.find_iter(text) {
                if !m.is_empty() {
                    record(source.clone(), m.start(), m.end());
                }
            }
        }

        if self.rule.category == FilterCategory::Pii {
            for hit in detect_pii(text) {
                record(format!("pii:{}", hit.detector), hit.start, hit.end);
            }
        }

        matches
    }
}

/// Literal, case-insensitive keyword match
fn keyword_regex(keyword: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(&regex::escape(keyword))
        .case_insensitive(true)
        .build()
}

fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Highest-severity match so far
struct Winner {
    action: FilterAction,
    category: FilterCategory,
    rule_id: Option<Uuid>,
    confidence: f64,
}

pub struct ContentFilter {
    rules: Arc<dyn FilterRuleStore>,
    logs: Arc<dyn FilterLogStore>,
    moderation: Option<Arc<dyn ModerationClient>>,
    moderation_timeout: Duration,
    audit: Option<Arc<AuditTrail>>,
    /// Enabled rules per direction
    active: ReadCache<Vec<CompiledRule>>,
    /// Enabled rule rows per direction, shared across instances
    shared: SharedRows,
}

impl ContentFilter {
    pub fn new(
        rules: Arc<dyn FilterRuleStore>,
        logs: Arc<dyn FilterLogStore>,
        cache: Arc<dyn Cache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            rules,
            logs,
            moderation: None,
            moderation_timeout: Duration::from_secs(2),
            audit: None,
            active: ReadCache::new(cache_ttl),
            shared: SharedRows::new(cache, cache_ttl),
        }
    }

    pub fn with_moderation(mut self, client: Arc<dyn ModerationClient>, timeout: Duration) -> Self {
        self.moderation = Some(client);
        self.moderation_timeout = timeout;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    // ========================================================================
    // Rule management
    // ========================================================================

    pub async fn create_rule(&self, request: CreateFilterRuleRequest) -> Result<ContentFilterRule> {
        request.validate()?;
        validate_conditions(&request.conditions)?;

        let now = Utc::now();
        let rule = ContentFilterRule {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            category: request.category,
            direction: request.direction,
            action: request.action,
            priority: request.priority,
            conditions: request.conditions,
            exceptions: request.exceptions,
            redaction_config: request.redaction_config,
            enabled: request.enabled,
            created_at: now,
            updated_at: now,
        };

        self.rules.insert_rule(&rule).await?;
        self.invalidate_caches().await;
        info!("Created filter rule '{}' ({})", rule.name, rule.id);
        self.audit_rule_change(&rule, "create_filter_rule").await;
        Ok(rule)
    }

    pub async fn update_rule(&self, id: Uuid, request: UpdateFilterRuleRequest) -> Result<ContentFilterRule> {
        request.validate()?;
        let mut rule = self.get_rule(id).await?;

        if let Some(conditions) = request.conditions {
            validate_conditions(&conditions)?;
            rule.conditions = conditions;
        }
        if let Some(name) = request.name {
            rule.name = name;
        }
        if let Some(description) = request.description {
            rule.description = Some(description);
        }
        if let Some(category) = request.category {
            rule.category = category;
        }
        if let Some(direction) = request.direction {
            rule.direction = direction;
        }
        if let Some(action) = request.action {
            rule.action = action;
        }
        if let Some(priority) = request.priority {
            rule.priority = priority;
        }
        if let Some(exceptions) = request.exceptions {
            rule.exceptions = exceptions;
        }
        if let Some(redaction_config) = request.redaction_config {
            rule.redaction_config = redaction_config;
        }
        if let Some(enabled) = request.enabled {
            rule.enabled = enabled;
        }

        self.save(rule, "update_filter_rule").await
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<ContentFilterRule> {
        let mut rule = self.get_rule(id).await?;
        rule.enabled = enabled;
        let action = if enabled {
            "enable_filter_rule"
        } else {
            "disable_filter_rule"
        };
        self.save(rule, action).await
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<ContentFilterRule> {
        self.rules
            .get_rule(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("Filter rule {} not found", id)))
    }

    pub async fn list_rules(&self) -> Result<Vec<ContentFilterRule>> {
        self.rules.list_rules().await
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<()> {
        let rule = self.get_rule(id).await?;
        self.rules.delete_rule(id).await?;
        self.invalidate_caches().await;
        info!("Deleted filter rule '{}' ({})", rule.name, id);
        self.audit_rule_change(&rule, "delete_filter_rule").await;
        Ok(())
    }

    async fn save(&self, mut rule: ContentFilterRule, action: &str) -> Result<ContentFilterRule> {
        rule.updated_at = Utc::now();
        self.rules.update_rule(&rule).await?;
        self.invalidate_caches().await;
        debug!("Saved filter rule {} ({})", rule.id, action);
        self.audit_rule_change(&rule, action).await;
        Ok(rule)
    }

    pub async fn get_statistics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<FilterStatistics> {
        if since >= until {
            return Err(validation_error("'since' must be before 'until'"));
        }
        self.logs.filter_statistics(since, until, TOP_RULES).await
    }

    // ========================================================================
    // Filtering
    // ========================================================================

    async fn active_rules(&self, direction: ContentDirection) -> Result<Arc<Vec<CompiledRule>>> {
        if let Some(cached) = self.active.get(direction.as_str()).await {
            return Ok(cached);
        }
        let key = shared_rules_key(direction);
        let rows: Vec<ContentFilterRule> = match self.shared.get(&key).await {
            Some(rows) => rows,
            None => {
                let rows = self.rules.list_enabled_rules(direction).await?;
                self.shared.put(&key, &rows).await;
                rows
            }
        };
        let compiled: Vec<CompiledRule> = rows
            .into_iter()
            .map(CompiledRule::compile)
            .collect();
        debug!(
            "Loaded {} enabled {} filter rules",
            compiled.len(),
            direction.as_str()
        );
        Ok(self.active.insert(direction.as_str(), compiled).await)
    }

    async fn invalidate_caches(&self) {
        self.active.invalidate_all().await;
        let keys = [
            shared_rules_key(ContentDirection::Input),
            shared_rules_key(ContentDirection::Output),
        ];
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.shared.invalidate(&keys).await;
    }

    pub async fn filter_content(&self, request: &FilterRequest) -> Result<FilterResult> {
        let rules = self.active_rules(request.direction).await?;

        let mut matches: Vec<FilterMatch> = Vec::new();
        let mut winner: Option<Winner> = None;

        for compiled in rules.iter() {
            if compiled.is_exempt(request) {
                continue;
            }
            let found = compiled.scan(&request.text);
            if found.is_empty() {
                continue;
            }

            let rule = &compiled.rule;
            // Rules arrive priority-descending, so ties keep the higher priority.
            if winner.as_ref().map_or(true, |w| rule.action > w.action) {
                winner = Some(Winner {
                    action: rule.action,
                    category: rule.category,
                    rule_id: Some(rule.id),
                    confidence: 1.0,
                });
            }
            matches.extend(found);
        }

        let moderation = if request.direction == ContentDirection::Input {
            None
        } else {
            self.moderate(&request.text).await
        };
        if let Some(signal) = &moderation {
            if winner.as_ref().map_or(true, |w| signal.action > w.action) {
                winner = Some(Winner {
                    action: signal.action,
                    category: signal.category,
                    rule_id: None,
                    confidence: signal.score,
                });
            }
        }

        let action = winner.as_ref().map_or(FilterAction::Allow, |w| w.action);
        let redacted_content = if action == FilterAction::Redact {
            Some(self.redact_matches(&rules, &request.text, &matches))
        } else {
            None
        };

        let result = FilterResult {
            action,
            category: winner.as_ref().map(|w| w.category),
            rule_id: winner.as_ref().and_then(|w| w.rule_id),
            matches,
            redacted_content,
            moderation,
        };

        if result.action != FilterAction::Allow {
            let confidence = winner.as_ref().map_or(1.0, |w| w.confidence);
            self.log_decision(request, &result, confidence).await?;
        }

        Ok(result)
    }

    fn redact_matches(&self, rules: &[CompiledRule], text: &str, matches: &[FilterMatch]) -> String {
        let configs: HashMap<Uuid, &RedactionConfig> = rules
            .iter()
            .map(|c| (c.rule.id, &c.rule.redaction_config))
            .collect();
        let fallback = RedactionConfig::default();

        let spans: Vec<RedactionSpan<'_>> = matches
            .iter()
            .map(|m| RedactionSpan {
                start: m.start,
                end: m.end,
                config: configs.get(&m.rule_id).copied().unwrap_or(&fallback),
            })
            .collect();
        redact(text, &spans)
    }

    /// Moderation with a timeout. Any failure is no signal.
    async fn moderate(&self, text: &str) -> Option<ModerationSignal> {
        let client = self.moderation.as_ref()?;
        match tokio::time::timeout(self.moderation_timeout, client.moderate(text)).await {
            Ok(Ok(outcome)) => outcome.to_signal(),
            Ok(Err(e)) => {
                warn!("Moderation unavailable, continuing without it: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Moderation timed out after {:?}, continuing without it",
                    self.moderation_timeout
                );
                None
            }
        }
    }

    async fn log_decision(&self, request: &FilterRequest, result: &FilterResult, confidence: f64) -> Result<()> {
        let entry = FilterLogEntry {
            id: Uuid::new_v4(),
            rule_id: result.rule_id,
            category: result.category,
            action: result.action,
            direction: request.direction,
            actor_id: request.actor_id.clone(),
            confidence,
            match_count: result.matches.len(),
            content_hash: content_hash(&request.text),
            created_at: Utc::now(),
        };
        self.logs.insert_filter_log(&entry).await?;

        if let Some(audit) = &self.audit {
            let actor = request
                .actor_id
                .as_deref()
                .map(Actor::user)
                .unwrap_or_else(Actor::system);
            let severity = if result.action == FilterAction::Block {
                AuditSeverity::Warning
            } else {
                AuditSeverity::Info
            };
            let details = EventDetails {
                rule_id: result.rule_id.map(|id| id.to_string()),
                ..EventDetails::default()
            }
            .with_extra("filterAction", serde_json::json!(result.action))
            .with_extra("category", serde_json::json!(result.category))
            .with_extra("matchCount", serde_json::json!(result.matches.len()))
            .with_extra("contentHash", serde_json::json!(entry.content_hash));

            audit
                .record_quietly(
                    RecordEventInput::new(
                        AuditEventType::ContentFiltered,
                        actor,
                        format!("filter_{}", request.direction.as_str()),
                    )
                    .severity(severity)
                    .outcome(AuditOutcome::Success)
                    .details(details),
                )
                .await;
        }
        Ok(())
    }

    async fn audit_rule_change(&self, rule: &ContentFilterRule, action: &str) {
        let Some(audit) = &self.audit else { return };
        audit
            .record_quietly(
                RecordEventInput::new(AuditEventType::FilterRuleChange, Actor::system(), action)
                    .resource(ResourceRef::new("filter_rule", Some(rule.id.to_string())))
                    .outcome(AuditOutcome::Success)
                    .details(EventDetails::described(format!(
                        "Filter rule '{}' ({} {}, enabled={})",
                        rule.name,
                        rule.category.as_str(),
                        rule.action,
                        rule.enabled
                    ))),
            )
            .await;
    }
}

/// Every pattern must compile when a rule is saved
fn shared_rules_key(direction: ContentDirection) -> String {
    format!("filter:rules:{}", direction.as_str())
}

fn validate_conditions(conditions: &RuleConditions) -> Result<()> {
    for pattern in &conditions.patterns {
        Regex::new(pattern)
            .map_err(|e| validation_error(format!("Malformed regex '{}': {}", pattern, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::filter::moderation::ModerationOutcome;
    use crate::filter::models::{RuleDirection, RuleExceptions};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn filter() -> (ContentFilter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let filter = ContentFilter::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(300),
        );
        (filter, store)
    }

    fn rule(category: FilterCategory, direction: RuleDirection, action: FilterAction) -> CreateFilterRuleRequest {
        CreateFilterRuleRequest {
            name: format!("{}-{}", category.as_str(), action),
            description: None,
            category,
            direction,
            action,
            priority: 0,
            conditions: RuleConditions::default(),
            exceptions: RuleExceptions::default(),
            redaction_config: RedactionConfig::default(),
            enabled: true,
        }
    }

    fn keywords(mut request: CreateFilterRuleRequest, words: &[&str]) -> CreateFilterRuleRequest {
        request.conditions.keywords = words.iter().map(|w| w.to_string()).collect();
        request
    }

    fn scan(text: &str, direction: ContentDirection) -> FilterRequest {
        FilterRequest {
            text: text.to_string(),
            direction,
            actor_id: Some("alice".to_string()),
            context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_pii_redaction_of_email() {
        let (filter, _store) = filter();
        filter
            .create_rule(rule(FilterCategory::Pii, RuleDirection::Output, FilterAction::Redact))
            .await
            .unwrap();

        let result = filter
            .filter_content(&scan("contact me at a@b.com", ContentDirection::Output))
            .await
            .unwrap();

        assert_eq!(result.action, FilterAction::Redact);
        assert_eq!(result.category, Some(FilterCategory::Pii));
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].matched_text, "a@b.com");
        assert_eq!(result.matches[0].pattern, "pii:email");
        assert_eq!(result.redacted_content.as_deref(), Some("contact me at [REDACTED]"));
    }

    #[tokio::test]
    async fn test_redaction_is_idempotent() {
        let (filter, _store) = filter();
        filter
            .create_rule(rule(FilterCategory::Pii, RuleDirection::Both, FilterAction::Redact))
            .await
            .unwrap();

        let first = filter
            .filter_content(&scan(
                "mail a@b.com or call 555-867-5309 from 10.0.0.1",
                ContentDirection::Input,
            ))
            .await
            .unwrap();
        let redacted = first.redacted_content.unwrap();

        let second = filter
            .filter_content(&scan(&redacted, ContentDirection::Input))
            .await
            .unwrap();
        assert!(second.matches.is_empty());
        assert_eq!(second.action, FilterAction::Allow);
    }

    #[tokio::test]
    async fn test_two_rules_on_one_span_redact_twice() {
        let (filter, _store) = filter();
        filter
            .create_rule(rule(FilterCategory::Pii, RuleDirection::Output, FilterAction::Redact))
            .await
            .unwrap();
        let mut custom = rule(FilterCategory::Custom, RuleDirection::Output, FilterAction::Redact);
        custom.conditions.patterns = vec![r"[a-z]@[a-z]\.com".to_string()];
        filter.create_rule(custom).await.unwrap();

        let result = filter
            .filter_content(&scan("contact me at a@b.com", ContentDirection::Output))
            .await
            .unwrap();
        assert_eq!(result.matches.len(), 2);
        assert_eq!(
            result.redacted_content.as_deref(),
            Some("contact me at [REDACTED]ED]")
        );
    }

    #[tokio::test]
    async fn test_highest_severity_wins_and_direction_applies() {
        let (filter, _store) = filter();
        let warn = filter
            .create_rule(keywords(
                rule(FilterCategory::Profanity, RuleDirection::Both, FilterAction::Warn),
                &["darn"],
            ))
            .await
            .unwrap();
        let block = filter
            .create_rule(keywords(
                rule(FilterCategory::Violence, RuleDirection::Input, FilterAction::Block),
                &["attack"],
            ))
            .await
            .unwrap();

        let result = filter
            .filter_content(&scan("Darn, ATTACK at dawn", ContentDirection::Input))
            .await
            .unwrap();
        assert_eq!(result.action, FilterAction::Block);
        assert_eq!(result.rule_id, Some(block.id));
        assert_eq!(result.matches.len(), 2);
        assert_eq!(result.redacted_content, None);

        // The input-only block rule does not apply to output
        let result = filter
            .filter_content(&scan("Darn, ATTACK at dawn", ContentDirection::Output))
            .await
            .unwrap();
        assert_eq!(result.action, FilterAction::Warn);
        assert_eq!(result.rule_id, Some(warn.id));
    }

    #[tokio::test]
    async fn test_exceptions_and_disabled_rules() {
        let (filter, _store) = filter();
        let mut request = keywords(
            rule(FilterCategory::Custom, RuleDirection::Both, FilterAction::Block),
            &["secret"],
        );
        request.exceptions = RuleExceptions {
            users: vec!["auditor".to_string()],
            contexts: vec!["legal_hold".to_string()],
        };
        let created = filter.create_rule(request).await.unwrap();

        let mut by_user = scan("top secret", ContentDirection::Input);
        by_user.actor_id = Some("auditor".to_string());
        assert_eq!(filter.filter_content(&by_user).await.unwrap().action, FilterAction::Allow);

        let mut by_context = scan("top secret", ContentDirection::Input);
        by_context.context.insert("legal_hold".to_string(), "case-7".to_string());
        assert_eq!(filter.filter_content(&by_context).await.unwrap().action, FilterAction::Allow);

        let plain = scan("top secret", ContentDirection::Input);
        assert_eq!(filter.filter_content(&plain).await.unwrap().action, FilterAction::Block);

        // Mutation invalidates the per-direction cache
        filter.set_enabled(created.id, false).await.unwrap();
        assert_eq!(filter.filter_content(&plain).await.unwrap().action, FilterAction::Allow);
    }

    #[tokio::test]
    async fn test_rule_rows_are_shared_through_the_cache() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let ttl = Duration::from_secs(300);
        let filter = ContentFilter::new(store.clone(), store.clone(), cache.clone(), ttl);
        let created = filter
            .create_rule(keywords(
                rule(FilterCategory::Custom, RuleDirection::Both, FilterAction::Block),
                &["secret"],
            ))
            .await
            .unwrap();

        let plain = scan("top secret", ContentDirection::Input);
        assert_eq!(filter.filter_content(&plain).await.unwrap().action, FilterAction::Block);
        assert!(cache.get("filter:rules:input").await.unwrap().is_some());
        assert_eq!(cache.get("filter:rules:output").await.unwrap(), None);

        // A second instance with no rules of its own sees the shared rows
        let empty = Arc::new(MemoryStore::new());
        let peer = ContentFilter::new(empty.clone(), empty, cache.clone(), ttl);
        assert_eq!(peer.filter_content(&plain).await.unwrap().action, FilterAction::Block);

        filter.set_enabled(created.id, false).await.unwrap();
        assert_eq!(cache.get("filter:rules:input").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_patterns() {
        let (filter, store) = filter();
        let mut request = rule(FilterCategory::Custom, RuleDirection::Both, FilterAction::Flag);
        request.conditions.patterns = vec!["(unclosed".to_string()];
        assert!(matches!(
            filter.create_rule(request).await,
            Err(GovernanceError::Validation(_))
        ));

        // A stored rule with one bad pattern still runs its good ones
        let mut stored = filter
            .create_rule(keywords(
                rule(FilterCategory::Custom, RuleDirection::Both, FilterAction::Flag),
                &["beta"],
            ))
            .await
            .unwrap();
        stored.conditions.patterns = vec!["(unclosed".to_string(), "alpha".to_string()];
        store.update_rule(&stored).await.unwrap();
        filter.invalidate_caches().await;

        let result = filter
            .filter_content(&scan("alpha and beta", ContentDirection::Input))
            .await
            .unwrap();
        assert_eq!(result.action, FilterAction::Flag);
        assert_eq!(result.matches.len(), 2);
    }

    #[tokio::test]
    async fn test_non_allow_decisions_are_logged() {
        let (filter, _store) = filter();
        let created = filter
            .create_rule(keywords(
                rule(FilterCategory::Custom, RuleDirection::Both, FilterAction::Log),
                &["ping"],
            ))
            .await
            .unwrap();

        filter
            .filter_content(&scan("ping ping", ContentDirection::Input))
            .await
            .unwrap();
        filter
            .filter_content(&scan("nothing here", ContentDirection::Input))
            .await
            .unwrap();

        let stats = filter
            .get_statistics(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_action.get("log"), Some(&1));
        assert_eq!(stats.top_rules[0].rule_id, created.id);
    }

    struct StaticModeration(ModerationOutcome);

    #[async_trait]
    impl ModerationClient for StaticModeration {
        async fn moderate(&self, _text: &str) -> Result<ModerationOutcome> {
            Ok(self.0.clone())
        }
    }

    struct DownModeration;

    #[async_trait]
    impl ModerationClient for DownModeration {
        async fn moderate(&self, _text: &str) -> Result<ModerationOutcome> {
            Err(GovernanceError::DependencyUnavailable("connection refused".to_string()))
        }
    }

    struct SlowModeration;

    #[async_trait]
    impl ModerationClient for SlowModeration {
        async fn moderate(&self, _text: &str) -> Result<ModerationOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ModerationOutcome {
                flagged: true,
                categories: vec!["violence".to_string()],
                scores: HashMap::from([("violence".to_string(), 1.0)]),
            })
        }
    }

    fn violent() -> ModerationOutcome {
        ModerationOutcome {
            flagged: true,
            categories: vec!["violence".to_string()],
            scores: HashMap::from([("violence".to_string(), 0.97)]),
        }
    }

    #[tokio::test]
    async fn test_moderation_outranks_rules_on_output_only() {
        let (filter, _store) = filter();
        let filter = filter.with_moderation(Arc::new(StaticModeration(violent())), Duration::from_secs(1));
        filter
            .create_rule(rule(FilterCategory::Pii, RuleDirection::Both, FilterAction::Redact))
            .await
            .unwrap();

        let result = filter
            .filter_content(&scan("mail a@b.com", ContentDirection::Output))
            .await
            .unwrap();
        assert_eq!(result.action, FilterAction::Block);
        assert_eq!(result.category, Some(FilterCategory::Violence));
        assert_eq!(result.rule_id, None);
        assert_eq!(result.redacted_content, None);

        // Input is never sent to moderation
        let result = filter
            .filter_content(&scan("mail a@b.com", ContentDirection::Input))
            .await
            .unwrap();
        assert_eq!(result.action, FilterAction::Redact);
        assert_eq!(result.moderation, None);
    }

    #[tokio::test]
    async fn test_moderation_failure_never_escalates() {
        for client in [
            Arc::new(DownModeration) as Arc<dyn ModerationClient>,
            Arc::new(SlowModeration) as Arc<dyn ModerationClient>,
        ] {
            let (filter, _store) = filter();
            let filter = filter.with_moderation(client, Duration::from_millis(20));
            filter
                .create_rule(keywords(
                    rule(FilterCategory::Profanity, RuleDirection::Output, FilterAction::Warn),
                    &["darn"],
                ))
                .await
                .unwrap();

            let result = filter
                .filter_content(&scan("darn it", ContentDirection::Output))
                .await
                .unwrap();
            assert_eq!(result.action, FilterAction::Warn);
            assert_eq!(result.moderation, None);

            let result = filter
                .filter_content(&scan("fine", ContentDirection::Output))
                .await
                .unwrap();
            assert_eq!(result.action, FilterAction::Allow);
        }
    }

    proptest! {
        #[test]
        fn prop_result_is_max_over_matched_rules(
            actions in proptest::collection::vec(0usize..6, 1..6),
            present in proptest::collection::vec(any::<bool>(), 6),
        ) {
            let (filter, _store) = filter();
            let mut text = String::from("start");
            let mut expected = FilterAction::Allow;

            tokio_test::block_on(async {
                for (i, action_idx) in actions.iter().enumerate() {
                    let action = FilterAction::ALL[*action_idx];
                    let word = format!("word{}", i);
                    filter
                        .create_rule(keywords(
                            rule(FilterCategory::Custom, RuleDirection::Both, action),
                            &[word.as_str()],
                        ))
                        .await
                        .unwrap();
                    if present[i] {
                        text.push(' ');
                        text.push_str(&word);
                        expected = expected.max(action);
                    }
                }
            });

            let result = tokio_test::block_on(filter.filter_content(&scan(&text, ContentDirection::Input))).unwrap();
            prop_assert_eq!(result.action, expected);
        }
    }
}
