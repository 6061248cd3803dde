//! Policy data model
//!
//! A policy has exactly one canonical row per id. Every semantic update
//! bumps `version`; older versions are not retained.

use crate::models::{Actor, ResourceRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    AccessControl,
    DataGovernance,
    ContentSafety,
    RateLimit,
    Compliance,
    Usage,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::AccessControl => "access_control",
            PolicyType::DataGovernance => "data_governance",
            PolicyType::ContentSafety => "content_safety",
            PolicyType::RateLimit => "rate_limit",
            PolicyType::Compliance => "compliance",
            PolicyType::Usage => "usage",
        }
    }
}

impl FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access_control" => Ok(PolicyType::AccessControl),
            "data_governance" => Ok(PolicyType::DataGovernance),
            "content_safety" => Ok(PolicyType::ContentSafety),
            "rate_limit" => Ok(PolicyType::RateLimit),
            "compliance" => Ok(PolicyType::Compliance),
            "usage" => Ok(PolicyType::Usage),
            other => Err(format!("Unknown policy type '{}'", other)),
        }
    }
}

/// How a failing policy affects the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementMode {
    /// First failure denies the action immediately
    Strict,
    /// Failures surface as warnings
    Permissive,
    /// Failures are recorded but never surfaced
    AuditOnly,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementMode::Strict => "strict",
            EnforcementMode::Permissive => "permissive",
            EnforcementMode::AuditOnly => "audit-only",
        }
    }
}

impl FromStr for EnforcementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(EnforcementMode::Strict),
            "permissive" => Ok(EnforcementMode::Permissive),
            "audit-only" => Ok(EnforcementMode::AuditOnly),
            other => Err(format!("Unknown enforcement mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Draft,
    Active,
    Deprecated,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Draft => "draft",
            PolicyStatus::Active => "active",
            PolicyStatus::Deprecated => "deprecated",
        }
    }
}

impl FromStr for PolicyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PolicyStatus::Draft),
            "active" => Ok(PolicyStatus::Active),
            "deprecated" => Ok(PolicyStatus::Deprecated),
            other => Err(format!("Unknown policy status '{}'", other)),
        }
    }
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Global,
    Organization,
    Team,
    User,
}

/// Which resources a policy is evaluated for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyScope {
    pub level: ScopeLevel,
    /// Empty means every resource type
    #[serde(default)]
    pub resource_types: Vec<String>,
}

impl PolicyScope {
    pub fn global() -> Self {
        Self {
            level: ScopeLevel::Global,
            resource_types: Vec::new(),
        }
    }

    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.resource_types.is_empty() || self.resource_types.iter().any(|t| t == resource_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// A rule as stored. The condition string is parsed into a typed
/// predicate when the policy is saved and again when it is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    #[validate(length(min = 1, message = "Rule id is required"))]
    pub id: String,
    #[validate(length(min = 1, message = "Rule condition is required"))]
    pub condition: String,
    pub action: RuleAction,
}

/// Optional narrowing of who/what a policy applies to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargets {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl PolicyTargets {
    pub fn matches(&self, actor: &Actor, action: &str) -> bool {
        (self.users.is_empty() || self.users.iter().any(|u| u == &actor.id))
            && (self.actions.is_empty() || self.actions.iter().any(|a| a == action))
    }
}

/// Exemption from a policy. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyException {
    pub id: Uuid,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PolicyException {
    pub fn applies(
        &self,
        actor: &Actor,
        action: &str,
        resource: &ResourceRef,
        now: DateTime<Utc>,
    ) -> bool {
        if self.expires_at.is_some_and(|exp| exp <= now) {
            return false;
        }
        let actor_ok = self.actor_id.as_deref().map_or(true, |id| id == actor.id);
        let action_ok = self.action.as_deref().map_or(true, |a| a == action);
        let resource_ok = self
            .resource_id
            .as_deref()
            .map_or(true, |id| resource.id.as_deref() == Some(id));
        actor_ok && action_ok && resource_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub scope: PolicyScope,
    pub enforcement_mode: EnforcementMode,
    pub rules: Vec<PolicyRule>,
    pub targets: Option<PolicyTargets>,
    #[serde(default)]
    pub exceptions: Vec<PolicyException>,
    pub version: i64,
    pub status: PolicyStatus,
    pub effective_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Whether `now` falls in `[effective_date, expiration_date]`
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        self.effective_date.map_or(true, |from| now >= from)
            && self.expiration_date.map_or(true, |until| now <= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationType {
    /// Strict denial
    Hard,
    /// Audit-only failure
    Soft,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::Hard => "hard",
            ViolationType::Soft => "soft",
        }
    }
}

impl FromStr for ViolationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard" => Ok(ViolationType::Hard),
            "soft" => Ok(ViolationType::Soft),
            other => Err(format!("Unknown violation type '{}'", other)),
        }
    }
}

/// Immutable record created as a side effect of evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolation {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub rule_id: String,
    pub user_id: String,
    pub action: String,
    pub resource: ResourceRef,
    pub violation_type: ViolationType,
    pub blocked: bool,
    pub details: String,
    pub context: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationFilter {
    pub policy_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub violation_type: Option<ViolationType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ViolationFilter {
    pub fn matches(&self, v: &PolicyViolation) -> bool {
        self.policy_id.map_or(true, |id| v.policy_id == id)
            && self.user_id.as_deref().map_or(true, |u| v.user_id == u)
            && self.violation_type.map_or(true, |t| v.violation_type == t)
            && self.since.map_or(true, |s| v.timestamp >= s)
            && self.until.map_or(true, |u| v.timestamp < u)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePolicyRequest {
    #[validate(length(min = 1, max = 255, message = "Policy name must be between 1 and 255 characters"))]
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    #[serde(default = "PolicyScope::global")]
    pub scope: PolicyScope,
    pub enforcement_mode: EnforcementMode,
    #[validate(nested)]
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    pub targets: Option<PolicyTargets>,
    #[serde(default)]
    pub exceptions: Vec<PolicyException>,
    pub effective_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}

/// Partial update; unset fields keep their current value
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicyRequest {
    #[validate(length(min = 1, max = 255, message = "Policy name must be between 1 and 255 characters"))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub scope: Option<PolicyScope>,
    pub enforcement_mode: Option<EnforcementMode>,
    #[validate(nested)]
    pub rules: Option<Vec<PolicyRule>>,
    pub targets: Option<PolicyTargets>,
    pub effective_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExceptionRequest {
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource_id: Option<String>,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A proposed action to evaluate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub actor: Actor,
    pub action: String,
    pub resource: ResourceRef,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPolicy {
    pub id: Uuid,
    pub name: String,
    pub version: i64,
    pub rule_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyWarning {
    pub policy_id: Uuid,
    pub policy_name: String,
    pub rule_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub matched_policy: Option<MatchedPolicy>,
    pub violation: Option<PolicyViolation>,
    pub warnings: Vec<PolicyWarning>,
}

impl PolicyDecision {
    pub fn allow(warnings: Vec<PolicyWarning>) -> Self {
        Self {
            allowed: true,
            matched_policy: None,
            violation: None,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn exception(actor: Option<&str>, expires_at: Option<DateTime<Utc>>) -> PolicyException {
        PolicyException {
            id: Uuid::new_v4(),
            actor_id: actor.map(String::from),
            action: Some("export".to_string()),
            resource_id: None,
            reason: "approved migration".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_exception_matching() {
        let now = Utc::now();
        let actor = Actor::user("alice");
        let resource = ResourceRef::new("dataset", Some("ds-1".to_string()));

        assert!(exception(Some("alice"), None).applies(&actor, "export", &resource, now));
        assert!(!exception(Some("bob"), None).applies(&actor, "export", &resource, now));
        assert!(!exception(Some("alice"), None).applies(&actor, "delete", &resource, now));
        assert!(!exception(None, Some(now - Duration::minutes(1))).applies(
            &actor, "export", &resource, now
        ));
    }

    #[test]
    fn test_scope_applies_to() {
        let scope = PolicyScope {
            level: ScopeLevel::Organization,
            resource_types: vec!["user".to_string()],
        };
        assert!(scope.applies_to("user"));
        assert!(!scope.applies_to("dataset"));
        assert!(PolicyScope::global().applies_to("anything"));
    }

    #[test]
    fn test_enforcement_mode_serde() {
        let mode: EnforcementMode = serde_json::from_str("\"audit-only\"").unwrap();
        assert_eq!(mode, EnforcementMode::AuditOnly);
        assert_eq!(mode.as_str().parse::<EnforcementMode>().unwrap(), mode);
    }
}
