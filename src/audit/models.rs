//! Audit event data model
//!
//! Events are append-only. `details` and `metadata` carry a bounded set of
//! well-known keys plus an open `extra` bag for forward compatibility.

use crate::models::{Actor, Pagination, ResourceRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Governance decisions
    PolicyEvaluation,
    PolicyViolation,
    PolicyChange,
    ContentFiltered,
    FilterRuleChange,
    LineageChange,

    // Access and authentication
    LoginSuccess,
    LoginFailure,
    AccessGranted,
    AccessDenied,
    BreachAttempt,

    // Data
    DataAccess,
    DataModification,
    DataExport,

    // System
    ConfigChange,
    SystemEvent,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 16] = [
        AuditEventType::PolicyEvaluation,
        AuditEventType::PolicyViolation,
        AuditEventType::PolicyChange,
        AuditEventType::ContentFiltered,
        AuditEventType::FilterRuleChange,
        AuditEventType::LineageChange,
        AuditEventType::LoginSuccess,
        AuditEventType::LoginFailure,
        AuditEventType::AccessGranted,
        AuditEventType::AccessDenied,
        AuditEventType::BreachAttempt,
        AuditEventType::DataAccess,
        AuditEventType::DataModification,
        AuditEventType::DataExport,
        AuditEventType::ConfigChange,
        AuditEventType::SystemEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::PolicyEvaluation => "policy_evaluation",
            AuditEventType::PolicyViolation => "policy_violation",
            AuditEventType::PolicyChange => "policy_change",
            AuditEventType::ContentFiltered => "content_filtered",
            AuditEventType::FilterRuleChange => "filter_rule_change",
            AuditEventType::LineageChange => "lineage_change",
            AuditEventType::LoginSuccess => "login_success",
            AuditEventType::LoginFailure => "login_failure",
            AuditEventType::AccessGranted => "access_granted",
            AuditEventType::AccessDenied => "access_denied",
            AuditEventType::BreachAttempt => "breach_attempt",
            AuditEventType::DataAccess => "data_access",
            AuditEventType::DataModification => "data_modification",
            AuditEventType::DataExport => "data_export",
            AuditEventType::ConfigChange => "config_change",
            AuditEventType::SystemEvent => "system_event",
        }
    }

    /// Types counted by the security-burst anomaly detector
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            AuditEventType::LoginFailure | AuditEventType::AccessDenied | AuditEventType::BreachAttempt
        )
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown audit event type '{}'", s))
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }

    /// Error and critical events are published immediately
    pub fn is_urgent(&self) -> bool {
        *self >= AuditSeverity::Error
    }
}

impl FromStr for AuditSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AuditSeverity::Info),
            "warning" => Ok(AuditSeverity::Warning),
            "error" => Ok(AuditSeverity::Error),
            "critical" => Ok(AuditSeverity::Critical),
            other => Err(format!("Unknown audit severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Error,
    #[default]
    Unknown,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Error => "error",
            AuditOutcome::Unknown => "unknown",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditOutcome::Success),
            "failure" => Ok(AuditOutcome::Failure),
            "error" => Ok(AuditOutcome::Error),
            "unknown" => Ok(AuditOutcome::Unknown),
            other => Err(format!("Unknown audit outcome '{}'", other)),
        }
    }
}

/// What happened, in well-known keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl EventDetails {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Where it happened, in well-known keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Audit event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub actor: Actor,
    pub action: String,
    pub resource: Option<ResourceRef>,
    pub outcome: AuditOutcome,
    pub details: EventDetails,
    pub metadata: EventMetadata,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Text searched by free-text queries
    pub fn search_text(&self) -> String {
        let details = serde_json::to_string(&self.details).unwrap_or_default();
        format!("{} {}", self.action, details).to_lowercase()
    }
}

/// Caller-supplied event; id and timestamp are assigned on record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEventInput {
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    #[serde(default)]
    pub severity: Option<AuditSeverity>,
    pub actor: Actor,
    pub action: String,
    #[serde(default)]
    pub resource: Option<ResourceRef>,
    #[serde(default)]
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub details: EventDetails,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl RecordEventInput {
    pub fn new(event_type: AuditEventType, actor: Actor, action: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: None,
            actor,
            action: action.into(),
            resource: None,
            outcome: AuditOutcome::Unknown,
            details: EventDetails::default(),
            metadata: EventMetadata::default(),
        }
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn details(mut self, details: EventDetails) -> Self {
        self.details = details;
        self
    }

    pub fn into_event(self, now: DateTime<Utc>) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            severity: self.severity.unwrap_or_default(),
            actor: self.actor,
            action: self.action,
            resource: self.resource,
            outcome: self.outcome,
            details: self.details,
            metadata: self.metadata,
            timestamp: now,
        }
    }
}

/// Conjunctive search filters; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub severity: Option<AuditSeverity>,
    pub actor_id: Option<String>,
    pub actor_type: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive match over action and details
    pub search: Option<String>,
}

impl AuditFilter {
    pub fn matches(&self, e: &AuditEvent) -> bool {
        let resource_type = e.resource.as_ref().map(|r| r.resource_type.as_str());
        let resource_id = e.resource.as_ref().and_then(|r| r.id.as_deref());

        self.event_type.map_or(true, |t| e.event_type == t)
            && self.severity.map_or(true, |s| e.severity == s)
            && self.actor_id.as_deref().map_or(true, |id| e.actor.id == id)
            && self.actor_type.as_deref().map_or(true, |t| e.actor.actor_type == t)
            && self.resource_type.as_deref().map_or(true, |t| resource_type == Some(t))
            && self.resource_id.as_deref().map_or(true, |id| resource_id == Some(id))
            && self.outcome.map_or(true, |o| e.outcome == o)
            && self.since.map_or(true, |s| e.timestamp >= s)
            && self.until.map_or(true, |u| e.timestamp < u)
            && self
                .search
                .as_deref()
                .map_or(true, |q| e.search_text().contains(&q.to_lowercase()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSearchRequest {
    #[serde(flatten)]
    pub filter: AuditFilter,
    #[serde(flatten)]
    pub pagination: Pagination,
}

/// Raw group-by counts for a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditAggregate {
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub by_outcome: HashMap<String, u64>,
    pub by_actor: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorCount {
    pub actor_id: String,
    pub events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatistics {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub by_outcome: HashMap<String, u64>,
    pub failure_rate: f64,
    pub top_actors: Vec<ActorCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighFailureRate,
    ActorVolume,
    SecurityBurst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: AuditSeverity,
    pub description: String,
    /// Actor id or event type the anomaly is about
    pub subject: Option<String>,
    pub observed: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReport {
    pub cutoff: DateTime<Utc>,
    pub archived: u64,
    pub deleted: u64,
}
