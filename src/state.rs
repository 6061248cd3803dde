//! Application state management
//!
//! Contains the four governance services shared across all handlers.

use crate::audit::AuditTrail;
use crate::cache::Cache;
use crate::config::Settings;
use crate::error::Result;
use crate::filter::{ContentFilter, HttpModerationClient, ModerationClient};
use crate::lineage::LineageTracker;
use crate::policy::PolicyEngine;
use crate::storage::GovernanceStore;
use std::sync::Arc;
use tracing::info;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Settings,

    /// Policy lifecycle and evaluation
    pub policy: PolicyEngine,

    /// Content rules, PII detection and moderation
    pub filter: ContentFilter,

    /// Buffered audit log; also shared with the other services
    pub audit: Arc<AuditTrail>,

    /// Data lineage graph
    pub lineage: LineageTracker,
}

impl AppState {
    /// Wire every service over one store and one cache
    pub fn new<S>(settings: Settings, store: Arc<S>, cache: Arc<dyn Cache>) -> Result<Self>
    where
        S: GovernanceStore + 'static,
    {
        let audit = Arc::new(AuditTrail::start(
            store.clone(),
            Arc::clone(&cache),
            settings.audit.clone(),
        ));

        let policy = PolicyEngine::new(
            store.clone(),
            store.clone(),
            Arc::clone(&cache),
            settings.cache.policy_ttl,
        )
        .with_audit(Arc::clone(&audit));

        let mut filter = ContentFilter::new(
            store.clone(),
            store.clone(),
            Arc::clone(&cache),
            settings.cache.filter_ttl,
        )
        .with_audit(Arc::clone(&audit));
        match HttpModerationClient::from_config(&settings.moderation)? {
            Some(client) => {
                info!("External moderation enabled");
                let client: Arc<dyn ModerationClient> = Arc::new(client);
                filter = filter.with_moderation(client, settings.moderation.timeout);
            }
            None => info!("No moderation API configured, rule-based filtering only"),
        }

        let lineage = LineageTracker::new(store).with_audit(Arc::clone(&audit));

        Ok(Self {
            settings,
            policy,
            filter,
            audit,
            lineage,
        })
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
