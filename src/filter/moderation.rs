//! External moderation API client

use super::models::{FilterAction, FilterCategory, ModerationSignal};
use crate::config::ModerationConfig;
use crate::error::{GovernanceError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Score at or above which a flagged category blocks outright
pub const BLOCK_SCORE: f64 = 0.9;

/// What the moderation service said about a text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModerationOutcome {
    pub flagged: bool,
    /// Names of the categories the service flagged
    pub categories: Vec<String>,
    pub scores: HashMap<String, f64>,
}

impl ModerationOutcome {
    /// Highest-scoring flagged category mapped onto a filter action
    pub fn to_signal(&self) -> Option<ModerationSignal> {
        if !self.flagged {
            return None;
        }
        let (name, score) = self
            .categories
            .iter()
            .map(|c| (c.as_str(), self.scores.get(c).copied().unwrap_or(0.0)))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        let action = if score >= BLOCK_SCORE {
            FilterAction::Block
        } else {
            FilterAction::Warn
        };
        Some(ModerationSignal {
            category: FilterCategory::from_moderation(name),
            action,
            score,
        })
    }
}

#[async_trait]
pub trait ModerationClient: Send + Sync {
    async fn moderate(&self, text: &str) -> Result<ModerationOutcome>;
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: HashMap<String, bool>,
    #[serde(default)]
    category_scores: HashMap<String, f64>,
}

impl From<ModerationResponse> for ModerationOutcome {
    fn from(response: ModerationResponse) -> Self {
        let mut outcome = ModerationOutcome::default();
        for result in response.results {
            outcome.flagged |= result.flagged;
            for (name, flagged) in result.categories {
                if flagged && !outcome.categories.contains(&name) {
                    outcome.categories.push(name);
                }
            }
            for (name, score) in result.category_scores {
                let entry = outcome.scores.entry(name).or_insert(0.0);
                *entry = entry.max(score);
            }
        }
        outcome.categories.sort();
        outcome
    }
}

/// Moderation over HTTP with bearer authentication
pub struct HttpModerationClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpModerationClient {
    pub fn new(url: impl Into<String>, api_key: Option<String>, config: &ModerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GovernanceError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }

    /// Build from configuration; `None` when no API URL is configured
    pub fn from_config(config: &ModerationConfig) -> Result<Option<Self>> {
        match &config.api_url {
            Some(url) => Self::new(url.clone(), config.api_key.clone(), config).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ModerationClient for HttpModerationClient {
    async fn moderate(&self, text: &str) -> Result<ModerationOutcome> {
        let mut request = self.client.post(&self.url).json(&ModerationRequest { input: text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GovernanceError::DependencyUnavailable(format!("Moderation API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GovernanceError::DependencyUnavailable(format!(
                "Moderation API returned {}",
                status
            )));
        }

        let body: ModerationResponse = response.json().await.map_err(|e| {
            GovernanceError::DependencyUnavailable(format!("Moderation API response: {}", e))
        })?;
        let outcome = ModerationOutcome::from(body);
        debug!(
            "Moderation result: flagged={} categories={:?}",
            outcome.flagged, outcome.categories
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "results": [{
                "flagged": true,
                "categories": {"violence": true, "hate": false, "harassment": true},
                "category_scores": {"violence": 0.95, "hate": 0.1, "harassment": 0.4}
            }]
        }"#;
        let response: ModerationResponse = serde_json::from_str(json).unwrap();
        let outcome = ModerationOutcome::from(response);

        assert!(outcome.flagged);
        assert_eq!(outcome.categories, vec!["harassment", "violence"]);

        let signal = outcome.to_signal().unwrap();
        assert_eq!(signal.category, FilterCategory::Violence);
        assert_eq!(signal.action, FilterAction::Block);
    }

    #[test]
    fn test_low_score_warns() {
        let outcome = ModerationOutcome {
            flagged: true,
            categories: vec!["self-harm".to_string()],
            scores: HashMap::from([("self-harm".to_string(), 0.55)]),
        };
        let signal = outcome.to_signal().unwrap();
        assert_eq!(signal.category, FilterCategory::SelfHarm);
        assert_eq!(signal.action, FilterAction::Warn);
    }

    #[test]
    fn test_unflagged_is_no_signal() {
        let outcome = ModerationOutcome {
            flagged: false,
            categories: Vec::new(),
            scores: HashMap::from([("violence".to_string(), 0.99)]),
        };
        assert_eq!(outcome.to_signal(), None);
    }

    #[test]
    fn test_from_config_without_url() {
        let client = HttpModerationClient::from_config(&ModerationConfig::default()).unwrap();
        assert!(client.is_none());
    }
}
