//! Policy Engine
//!
//! Manages the policy lifecycle and evaluates proposed actions against the
//! active policy set.
//!
//! Evaluation walks active policies in `(created_at, id)` order. A policy
//! fails when any of its `deny` rules matches; `allow` rules never fail it.
//! A failing strict policy ends evaluation immediately.

use super::condition::{Condition, ConditionInput};
use super::models::{
    CreateExceptionRequest, CreatePolicyRequest, EnforcementMode, EvaluationRequest,
    MatchedPolicy, Policy, PolicyDecision, PolicyException, PolicyRule, PolicyStatus, PolicyType,
    PolicyViolation, PolicyWarning, RuleAction, UpdatePolicyRequest, ViolationFilter,
    ViolationType,
};
use crate::audit::{
    AuditEventType, AuditOutcome, AuditSeverity, AuditTrail, EventDetails, RecordEventInput,
};
use crate::cache::{Cache, ReadCache, SharedRows};
use crate::error::{validation_error, GovernanceError, Result};
use crate::models::{Actor, Page, Pagination, ResourceRef};
use crate::storage::{PolicyStore, ViolationStore};
use chrono::{DateTime, Timelike, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// A policy with its rule conditions parsed
pub struct CompiledPolicy {
    pub policy: Policy,
    rules: Vec<(PolicyRule, Condition)>,
}

impl CompiledPolicy {
    pub fn compile(policy: Policy) -> Self {
        let rules = policy
            .rules
            .iter()
            .map(|rule| (rule.clone(), Condition::parse_lenient(&rule.condition)))
            .collect();
        Self { policy, rules }
    }

    /// The first matching deny rule, if any. Allow rules never fail a
    /// policy and never mask a deny.
    async fn failing_rule(
        &self,
        request: &EvaluationRequest,
        now: DateTime<Utc>,
        cache: &dyn Cache,
    ) -> Option<&PolicyRule> {
        for (rule, condition) in &self.rules {
            if rule.action == RuleAction::Allow {
                continue;
            }
            let input = ConditionInput {
                actor: &request.actor,
                action: &request.action,
                resource: &request.resource,
                hour: now.hour(),
                counter_scope: format!("policy:{}:{}", self.policy.id, rule.id),
            };
            if condition.matches(&input, Some(cache)).await {
                return Some(rule);
            }
        }
        None
    }
}

const ACTIVE_POLICIES_KEY: &str = "policy:active";

pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
    violations: Arc<dyn ViolationStore>,
    cache: Arc<dyn Cache>,
    audit: Option<Arc<AuditTrail>>,
    /// Active policies per resource type
    active: ReadCache<Vec<CompiledPolicy>>,
    /// Every active policy row, shared across instances
    shared: SharedRows,
    /// Audit-only violation writes still in flight
    background: Mutex<JoinSet<()>>,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        violations: Arc<dyn ViolationStore>,
        cache: Arc<dyn Cache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            violations,
            shared: SharedRows::new(Arc::clone(&cache), cache_ttl),
            cache,
            audit: None,
            active: ReadCache::new(cache_ttl),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn create_policy(&self, request: CreatePolicyRequest) -> Result<Policy> {
        request.validate()?;
        validate_rules(&request.rules)?;
        validate_window(request.effective_date, request.expiration_date)?;

        let now = Utc::now();
        let policy = Policy {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            policy_type: request.policy_type,
            scope: request.scope,
            enforcement_mode: request.enforcement_mode,
            rules: request.rules,
            targets: request.targets,
            exceptions: request.exceptions,
            version: 1,
            status: PolicyStatus::Draft,
            effective_date: request.effective_date,
            expiration_date: request.expiration_date,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_policy(&policy).await?;
        self.invalidate_caches().await;
        info!("Created policy '{}' ({})", policy.name, policy.id);
        self.audit_change(&policy, "create_policy").await;
        Ok(policy)
    }

    /// Apply a partial update. Concurrent updates are last-writer-wins.
    pub async fn update_policy(&self, id: Uuid, request: UpdatePolicyRequest) -> Result<Policy> {
        request.validate()?;
        let mut policy = self.get_policy(id).await?;

        if let Some(rules) = request.rules {
            validate_rules(&rules)?;
            policy.rules = rules;
        }
        if let Some(name) = request.name {
            policy.name = name;
        }
        if let Some(description) = request.description {
            policy.description = Some(description);
        }
        if let Some(scope) = request.scope {
            policy.scope = scope;
        }
        if let Some(mode) = request.enforcement_mode {
            policy.enforcement_mode = mode;
        }
        if let Some(targets) = request.targets {
            policy.targets = Some(targets);
        }
        if let Some(effective) = request.effective_date {
            policy.effective_date = Some(effective);
        }
        if let Some(expiration) = request.expiration_date {
            policy.expiration_date = Some(expiration);
        }
        validate_window(policy.effective_date, policy.expiration_date)?;

        self.save(policy, "update_policy").await
    }

    pub async fn get_policy(&self, id: Uuid) -> Result<Policy> {
        self.store
            .get_policy(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("Policy {} not found", id)))
    }

    pub async fn list_policies(
        &self,
        status: Option<PolicyStatus>,
        policy_type: Option<PolicyType>,
    ) -> Result<Vec<Policy>> {
        let mut policies = self.store.list_policies(status).await?;
        if let Some(policy_type) = policy_type {
            policies.retain(|p| p.policy_type == policy_type);
        }
        Ok(policies)
    }

    pub async fn delete_policy(&self, id: Uuid) -> Result<()> {
        let policy = self.get_policy(id).await?;
        self.store.delete_policy(id).await?;
        self.invalidate_caches().await;
        info!("Deleted policy '{}' ({})", policy.name, id);
        self.audit_change(&policy, "delete_policy").await;
        Ok(())
    }

    /// draft -> active
    pub async fn activate_policy(&self, id: Uuid) -> Result<Policy> {
        let mut policy = self.get_policy(id).await?;
        if policy.status != PolicyStatus::Draft {
            return Err(validation_error(format!(
                "Only draft policies can be activated (policy is {})",
                policy.status
            )));
        }
        policy.status = PolicyStatus::Active;
        self.save(policy, "activate_policy").await
    }

    /// active -> deprecated
    pub async fn deprecate_policy(&self, id: Uuid) -> Result<Policy> {
        let mut policy = self.get_policy(id).await?;
        if policy.status != PolicyStatus::Active {
            return Err(validation_error(format!(
                "Only active policies can be deprecated (policy is {})",
                policy.status
            )));
        }
        policy.status = PolicyStatus::Deprecated;
        self.save(policy, "deprecate_policy").await
    }

    pub async fn add_exception(&self, id: Uuid, request: CreateExceptionRequest) -> Result<Policy> {
        if request.reason.trim().is_empty() {
            return Err(validation_error("Exception reason is required"));
        }
        let mut policy = self.get_policy(id).await?;
        policy.exceptions.push(PolicyException {
            id: Uuid::new_v4(),
            actor_id: request.actor_id,
            action: request.action,
            resource_id: request.resource_id,
            reason: request.reason,
            expires_at: request.expires_at,
        });
        self.save(policy, "add_exception").await
    }

    pub async fn remove_exception(&self, id: Uuid, exception_id: Uuid) -> Result<Policy> {
        let mut policy = self.get_policy(id).await?;
        let before = policy.exceptions.len();
        policy.exceptions.retain(|e| e.id != exception_id);
        if policy.exceptions.len() == before {
            return Err(GovernanceError::NotFound(format!(
                "Exception {} not found on policy {}",
                exception_id, id
            )));
        }
        self.save(policy, "remove_exception").await
    }

    /// Bump the version, persist, and invalidate the evaluation cache
    async fn save(&self, mut policy: Policy, action: &str) -> Result<Policy> {
        policy.version += 1;
        policy.updated_at = Utc::now();
        self.store.update_policy(&policy).await?;
        self.invalidate_caches().await;
        debug!(
            "Saved policy {} at version {} ({})",
            policy.id, policy.version, action
        );
        self.audit_change(&policy, action).await;
        Ok(policy)
    }

    pub async fn list_violations(
        &self,
        filter: &ViolationFilter,
        pagination: Pagination,
    ) -> Result<Page<PolicyViolation>> {
        let pagination = pagination.checked()?;
        let rows = self
            .violations
            .list_violations(filter, pagination.offset, pagination.limit + 1)
            .await?;
        Ok(Page::from_overfetch(rows, pagination))
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    async fn active_policies(&self, resource_type: &str) -> Result<Arc<Vec<CompiledPolicy>>> {
        if let Some(cached) = self.active.get(resource_type).await {
            return Ok(cached);
        }

        let rows: Vec<Policy> = match self.shared.get(ACTIVE_POLICIES_KEY).await {
            Some(rows) => rows,
            None => {
                let rows = self.store.list_policies(Some(PolicyStatus::Active)).await?;
                self.shared.put(ACTIVE_POLICIES_KEY, &rows).await;
                rows
            }
        };
        let compiled: Vec<CompiledPolicy> = rows
            .into_iter()
            .filter(|p| p.scope.applies_to(resource_type))
            .map(CompiledPolicy::compile)
            .collect();
        debug!(
            "Loaded {} active policies for resource type '{}'",
            compiled.len(),
            resource_type
        );
        Ok(self.active.insert(resource_type, compiled).await)
    }

    async fn invalidate_caches(&self) {
        self.active.invalidate_all().await;
        self.shared.invalidate(&[ACTIVE_POLICIES_KEY]).await;
    }

    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<PolicyDecision> {
        let now = Utc::now();
        let policies = self.active_policies(&request.resource.resource_type).await?;
        let mut warnings = Vec::new();

        for compiled in policies.iter() {
            let policy = &compiled.policy;

            if !policy.is_in_effect(now) {
                continue;
            }
            if let Some(targets) = &policy.targets {
                if !targets.matches(&request.actor, &request.action) {
                    continue;
                }
            }
            if policy
                .exceptions
                .iter()
                .any(|e| e.applies(&request.actor, &request.action, &request.resource, now))
            {
                debug!("Policy {} skipped by exception for {}", policy.id, request.actor.id);
                continue;
            }

            let Some(rule) = compiled
                .failing_rule(request, now, self.cache.as_ref())
                .await
            else {
                continue;
            };

            match policy.enforcement_mode {
                EnforcementMode::Strict => {
                    let violation = violation(policy, rule, request, ViolationType::Hard, now);
                    self.violations.insert_violation(&violation).await?;
                    info!(
                        "Denied '{}' by {} on {}: policy '{}' rule '{}'",
                        request.action,
                        request.actor.id,
                        request.resource.resource_type,
                        policy.name,
                        rule.id
                    );
                    self.audit_violation(&violation, AuditSeverity::Warning).await;

                    return Ok(PolicyDecision {
                        allowed: false,
                        matched_policy: Some(MatchedPolicy {
                            id: policy.id,
                            name: policy.name.clone(),
                            version: policy.version,
                            rule_id: rule.id.clone(),
                        }),
                        violation: Some(violation),
                        warnings: Vec::new(),
                    });
                }
                EnforcementMode::Permissive => {
                    warnings.push(PolicyWarning {
                        policy_id: policy.id,
                        policy_name: policy.name.clone(),
                        rule_id: rule.id.clone(),
                        message: format!(
                            "Action '{}' violates policy '{}' (rule '{}')",
                            request.action, policy.name, rule.id
                        ),
                    });
                    self.audit_warning(policy, rule, request).await;
                }
                EnforcementMode::AuditOnly => {
                    let violation = violation(policy, rule, request, ViolationType::Soft, now);
                    self.persist_soft_violation(violation);
                }
            }
        }

        Ok(PolicyDecision::allow(warnings))
    }

    /// Wait for audit-only violation writes still in flight. Call before
    /// stopping the audit trail.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.background_tasks());
        if tasks.is_empty() {
            return;
        }
        debug!("Waiting for {} violation writes", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Violation write task failed: {}", e);
            }
        }
    }

    fn background_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist and audit off the request path
    fn persist_soft_violation(&self, violation: PolicyViolation) {
        let store = Arc::clone(&self.violations);
        let audit = self.audit.clone();
        let mut tasks = self.background_tasks();
        // Reap finished writes
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = store.insert_violation(&violation).await {
                warn!("Failed to persist audit-only violation {}: {}", violation.id, e);
            }
            if let Some(audit) = audit {
                audit
                    .record_quietly(violation_event(&violation, AuditSeverity::Info))
                    .await;
            }
        });
    }

    // ========================================================================
    // Audit side effects
    // ========================================================================

    async fn audit_change(&self, policy: &Policy, action: &str) {
        let Some(audit) = &self.audit else { return };
        let actor = policy
            .created_by
            .as_deref()
            .map(Actor::user)
            .unwrap_or_else(Actor::system);
        let details = EventDetails {
            policy_id: Some(policy.id),
            ..EventDetails::described(format!(
                "Policy '{}' is {} at version {}",
                policy.name, policy.status, policy.version
            ))
        };
        audit
            .record_quietly(
                RecordEventInput::new(AuditEventType::PolicyChange, actor, action)
                    .resource(ResourceRef::new("policy", Some(policy.id.to_string())))
                    .outcome(AuditOutcome::Success)
                    .details(details),
            )
            .await;
    }

    async fn audit_violation(&self, violation: &PolicyViolation, severity: AuditSeverity) {
        if let Some(audit) = &self.audit {
            audit.record_quietly(violation_event(violation, severity)).await;
        }
    }

    async fn audit_warning(&self, policy: &Policy, rule: &PolicyRule, request: &EvaluationRequest) {
        let Some(audit) = &self.audit else { return };
        let details = EventDetails {
            policy_id: Some(policy.id),
            rule_id: Some(rule.id.clone()),
            ..EventDetails::described(format!("Permissive policy '{}' failed", policy.name))
        };
        audit
            .record_quietly(
                RecordEventInput::new(
                    AuditEventType::PolicyEvaluation,
                    request.actor.clone(),
                    request.action.clone(),
                )
                .severity(AuditSeverity::Warning)
                .resource(request.resource.clone())
                .outcome(AuditOutcome::Success)
                .details(details),
            )
            .await;
    }
}

fn violation(
    policy: &Policy,
    rule: &PolicyRule,
    request: &EvaluationRequest,
    violation_type: ViolationType,
    now: DateTime<Utc>,
) -> PolicyViolation {
    PolicyViolation {
        id: Uuid::new_v4(),
        policy_id: policy.id,
        rule_id: rule.id.clone(),
        user_id: request.actor.id.clone(),
        action: request.action.clone(),
        resource: request.resource.clone(),
        violation_type,
        blocked: violation_type == ViolationType::Hard,
        details: format!(
            "Rule '{}' of policy '{}' (v{}) matched: {}",
            rule.id, policy.name, policy.version, rule.condition
        ),
        context: request.context.clone(),
        timestamp: now,
    }
}

fn violation_event(violation: &PolicyViolation, severity: AuditSeverity) -> RecordEventInput {
    let details = EventDetails {
        policy_id: Some(violation.policy_id),
        rule_id: Some(violation.rule_id.clone()),
        reason: Some(violation.details.clone()),
        ..Default::default()
    }
    .with_extra("violationType", serde_json::json!(violation.violation_type))
    .with_extra("blocked", serde_json::json!(violation.blocked));

    let outcome = if violation.blocked {
        AuditOutcome::Failure
    } else {
        AuditOutcome::Success
    };

    RecordEventInput::new(
        AuditEventType::PolicyViolation,
        Actor::user(violation.user_id.clone()),
        violation.action.clone(),
    )
    .severity(severity)
    .resource(violation.resource.clone())
    .outcome(outcome)
    .details(details)
}

/// Rule ids are unique and every condition parses
fn validate_rules(rules: &[PolicyRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        rule.validate()?;
        if !seen.insert(rule.id.as_str()) {
            return Err(validation_error(format!("Duplicate rule id '{}'", rule.id)));
        }
        Condition::parse(&rule.condition).map_err(|e| {
            validation_error(format!("Rule '{}' has an invalid condition: {}", rule.id, e))
        })?;
    }
    Ok(())
}

fn validate_window(from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Result<()> {
    match (from, until) {
        (Some(from), Some(until)) if from > until => Err(validation_error(
            "effectiveDate must not be after expirationDate",
        )),
        _ => Ok(()),
    }
}
