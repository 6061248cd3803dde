//! Content filter data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Filter actions, declared in ascending severity.
///
/// The derived `Ord` is the total order `allow < log < flag < warn <
/// redact < block` used to resolve multiple matching rules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    #[default]
    Allow,
    Log,
    Flag,
    Warn,
    Redact,
    Block,
}

impl FilterAction {
    pub const ALL: [FilterAction; 6] = [
        FilterAction::Allow,
        FilterAction::Log,
        FilterAction::Flag,
        FilterAction::Warn,
        FilterAction::Redact,
        FilterAction::Block,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterAction::Allow => "allow",
            FilterAction::Log => "log",
            FilterAction::Flag => "flag",
            FilterAction::Warn => "warn",
            FilterAction::Redact => "redact",
            FilterAction::Block => "block",
        }
    }
}

impl FromStr for FilterAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("Unknown filter action '{}'", s))
    }
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCategory {
    Pii,
    HateSpeech,
    Violence,
    SelfHarm,
    Sexual,
    Harassment,
    Profanity,
    Custom,
}

impl FilterCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterCategory::Pii => "pii",
            FilterCategory::HateSpeech => "hate_speech",
            FilterCategory::Violence => "violence",
            FilterCategory::SelfHarm => "self_harm",
            FilterCategory::Sexual => "sexual",
            FilterCategory::Harassment => "harassment",
            FilterCategory::Profanity => "profanity",
            FilterCategory::Custom => "custom",
        }
    }

    /// Map a moderation-API category name onto ours
    pub fn from_moderation(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.starts_with("hate") {
            FilterCategory::HateSpeech
        } else if name.starts_with("violence") {
            FilterCategory::Violence
        } else if name.starts_with("self-harm") || name.starts_with("self_harm") {
            FilterCategory::SelfHarm
        } else if name.starts_with("sexual") {
            FilterCategory::Sexual
        } else if name.starts_with("harassment") {
            FilterCategory::Harassment
        } else {
            FilterCategory::Custom
        }
    }
}

impl FromStr for FilterCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pii" => Ok(FilterCategory::Pii),
            "hate_speech" => Ok(FilterCategory::HateSpeech),
            "violence" => Ok(FilterCategory::Violence),
            "self_harm" => Ok(FilterCategory::SelfHarm),
            "sexual" => Ok(FilterCategory::Sexual),
            "harassment" => Ok(FilterCategory::Harassment),
            "profanity" => Ok(FilterCategory::Profanity),
            "custom" => Ok(FilterCategory::Custom),
            other => Err(format!("Unknown filter category '{}'", other)),
        }
    }
}

/// Direction of a rule; `Both` applies to input and output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Input,
    Output,
    Both,
}

impl RuleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleDirection::Input => "input",
            RuleDirection::Output => "output",
            RuleDirection::Both => "both",
        }
    }

    pub fn applies_to(&self, direction: ContentDirection) -> bool {
        match self {
            RuleDirection::Both => true,
            RuleDirection::Input => direction == ContentDirection::Input,
            RuleDirection::Output => direction == ContentDirection::Output,
        }
    }
}

impl FromStr for RuleDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(RuleDirection::Input),
            "output" => Ok(RuleDirection::Output),
            "both" => Ok(RuleDirection::Both),
            other => Err(format!("Unknown rule direction '{}'", other)),
        }
    }
}

/// Direction of the content being scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentDirection {
    Input,
    Output,
}

impl ContentDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentDirection::Input => "input",
            ContentDirection::Output => "output",
        }
    }
}

impl FromStr for ContentDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(ContentDirection::Input),
            "output" => Ok(ContentDirection::Output),
            other => Err(format!("Unknown content direction '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleExceptions {
    #[serde(default)]
    pub users: Vec<String>,
    /// Context keys whose presence exempts the request
    #[serde(default)]
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactionConfig {
    pub replacement: Option<String>,
    pub mask_char: Option<char>,
    #[serde(default)]
    pub preserve_length: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentFilterRule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub category: FilterCategory,
    pub direction: RuleDirection,
    pub action: FilterAction,
    /// Higher is evaluated first
    pub priority: i32,
    pub conditions: RuleConditions,
    pub exceptions: RuleExceptions,
    pub redaction_config: RedactionConfig,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateFilterRuleRequest {
    #[validate(length(min = 1, max = 255, message = "Rule name must be between 1 and 255 characters"))]
    pub name: String,
    pub description: Option<String>,
    pub category: FilterCategory,
    pub direction: RuleDirection,
    pub action: FilterAction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub exceptions: RuleExceptions,
    #[serde(default)]
    pub redaction_config: RedactionConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFilterRuleRequest {
    #[validate(length(min = 1, max = 255, message = "Rule name must be between 1 and 255 characters"))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<FilterCategory>,
    pub direction: Option<RuleDirection>,
    pub action: Option<FilterAction>,
    pub priority: Option<i32>,
    pub conditions: Option<RuleConditions>,
    pub exceptions: Option<RuleExceptions>,
    pub redaction_config: Option<RedactionConfig>,
    pub enabled: Option<bool>,
}

/// One matched span. Offsets are byte offsets into the scanned text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMatch {
    pub rule_id: Uuid,
    pub pattern: String,
    pub start: usize,
    pub end: usize,
    pub matched_text: String,
}

/// Signal from the external moderation API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationSignal {
    pub category: FilterCategory,
    pub action: FilterAction,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterResult {
    pub action: FilterAction,
    pub category: Option<FilterCategory>,
    /// Rule owning the highest-severity action, when a rule won
    pub rule_id: Option<Uuid>,
    pub matches: Vec<FilterMatch>,
    pub redacted_content: Option<String>,
    pub moderation: Option<ModerationSignal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRequest {
    pub text: String,
    pub direction: ContentDirection,
    pub actor_id: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// Persisted record of a non-allow decision, used for statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterLogEntry {
    pub id: Uuid,
    pub rule_id: Option<Uuid>,
    pub category: Option<FilterCategory>,
    pub action: FilterAction,
    pub direction: ContentDirection,
    pub actor_id: Option<String>,
    pub confidence: f64,
    pub match_count: usize,
    /// SHA-256 of the scanned text; the text itself is never stored
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStatistics {
    pub total: u64,
    pub by_action: HashMap<String, u64>,
    pub by_category: HashMap<String, u64>,
    pub top_rules: Vec<RuleHitCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleHitCount {
    pub rule_id: Uuid,
    pub hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_total_order() {
        let mut shuffled = vec![
            FilterAction::Redact,
            FilterAction::Allow,
            FilterAction::Block,
            FilterAction::Log,
            FilterAction::Warn,
            FilterAction::Flag,
        ];
        shuffled.sort();
        assert_eq!(shuffled, FilterAction::ALL.to_vec());
    }

    #[test]
    fn test_direction_applies() {
        assert!(RuleDirection::Both.applies_to(ContentDirection::Input));
        assert!(RuleDirection::Both.applies_to(ContentDirection::Output));
        assert!(!RuleDirection::Output.applies_to(ContentDirection::Input));
    }

    #[test]
    fn test_moderation_category_mapping() {
        assert_eq!(FilterCategory::from_moderation("hate/threatening"), FilterCategory::HateSpeech);
        assert_eq!(FilterCategory::from_moderation("self-harm/intent"), FilterCategory::SelfHarm);
        assert_eq!(FilterCategory::from_moderation("illicit"), FilterCategory::Custom);
    }
}
