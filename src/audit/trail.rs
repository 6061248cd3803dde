//! Audit Trail
//!
//! Append-only event log with write-behind durability and an immediate
//! side channel for urgent events.

use super::anomaly;
use super::buffer::AuditBuffer;
use super::models::{
    ActorCount, Anomaly, ArchiveReport, AuditEvent, AuditFilter, AuditStatistics, RecordEventInput,
};
use crate::cache::Cache;
use crate::config::AuditConfig;
use crate::error::{validation_error, GovernanceError, Result};
use crate::models::{Page, Pagination};
use crate::storage::AuditStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TOP_ACTORS: usize = 10;

pub fn type_channel(event_type: &str) -> String {
    format!("audit:type:{}", event_type)
}

pub fn severity_channel(severity: &str) -> String {
    format!("audit:severity:{}", severity)
}

pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    cache: Arc<dyn Cache>,
    buffer: AuditBuffer,
}

impl AuditTrail {
    /// Start the trail and its background flush task
    pub fn start(store: Arc<dyn AuditStore>, cache: Arc<dyn Cache>, config: AuditConfig) -> Self {
        info!(
            "Starting audit trail (flush every {:?}, capacity {})",
            config.flush_interval, config.buffer_capacity
        );
        let buffer = AuditBuffer::start(Arc::clone(&store), config);
        Self {
            store,
            cache,
            buffer,
        }
    }

    pub async fn record_event(&self, input: RecordEventInput) -> Result<AuditEvent> {
        let event = input.into_event(Utc::now());
        self.publish_if_urgent(&event).await;
        self.enqueue(vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn record_events(&self, inputs: Vec<RecordEventInput>) -> Result<Vec<AuditEvent>> {
        let now = Utc::now();
        let events: Vec<AuditEvent> = inputs.into_iter().map(|i| i.into_event(now)).collect();
        for event in &events {
            self.publish_if_urgent(event).await;
        }
        self.enqueue(events.clone()).await?;
        Ok(events)
    }

    /// Record without surfacing failures; for side effects of other operations
    pub async fn record_quietly(&self, input: RecordEventInput) {
        if let Err(e) = self.record_event(input).await {
            warn!("Failed to record audit event: {}", e);
        }
    }

    async fn enqueue(&self, events: Vec<AuditEvent>) -> Result<()> {
        match self.buffer.push(events.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                // Stopped: write through so nothing recorded late is lost.
                warn!("Audit buffer stopped, writing {} events directly", events.len());
                self.store.insert_events(&events).await
            }
        }
    }

    async fn publish_if_urgent(&self, event: &AuditEvent) {
        if !event.severity.is_urgent() {
            return;
        }
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to serialize audit event {}: {}", event.id, e);
                return;
            }
        };
        for channel in [
            type_channel(event.event_type.as_str()),
            severity_channel(event.severity.as_str()),
        ] {
            if let Err(e) = self.cache.publish(&channel, payload.clone()).await {
                warn!("Failed to publish audit event to '{}': {}", channel, e);
            }
        }
    }

    pub fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        if !channel.starts_with("audit:") {
            return Err(validation_error(format!(
                "Unknown audit channel '{}'",
                channel
            )));
        }
        self.cache.subscribe(channel)
    }

    /// Write everything buffered so far
    pub async fn flush(&self) -> Result<usize> {
        self.buffer.flush().await
    }

    /// Drain the buffer and stop the flush task
    pub async fn stop(&self) {
        self.buffer.stop().await;
    }

    pub async fn get_event(&self, id: Uuid) -> Result<AuditEvent> {
        self.store
            .get_event(id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("Audit event {} not found", id)))
    }

    pub async fn search_events(
        &self,
        filter: &AuditFilter,
        pagination: Pagination,
    ) -> Result<Page<AuditEvent>> {
        let pagination = pagination.checked()?;
        let rows = self
            .store
            .search_events(filter, pagination.offset, pagination.limit + 1)
            .await?;
        Ok(Page::from_overfetch(rows, pagination))
    }

    pub async fn get_statistics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<AuditStatistics> {
        check_window(since, until)?;
        let agg = self.store.aggregate_events(since, until).await?;

        let mut top_actors: Vec<ActorCount> = agg
            .by_actor
            .iter()
            .map(|(actor_id, events)| ActorCount {
                actor_id: actor_id.clone(),
                events: *events,
            })
            .collect();
        top_actors.sort_by(|a, b| b.events.cmp(&a.events).then(a.actor_id.cmp(&b.actor_id)));
        top_actors.truncate(TOP_ACTORS);

        Ok(AuditStatistics {
            since,
            until,
            total: agg.total,
            failure_rate: anomaly::failure_rate(&agg),
            by_type: agg.by_type,
            by_severity: agg.by_severity,
            by_outcome: agg.by_outcome,
            top_actors,
        })
    }

    pub async fn detect_anomalies(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>> {
        check_window(since, until)?;
        let agg = self.store.aggregate_events(since, until).await?;
        let anomalies = anomaly::detect(&agg);
        if !anomalies.is_empty() {
            warn!("Detected {} audit anomalies", anomalies.len());
        }
        Ok(anomalies)
    }

    /// Copy rows older than `cutoff` to the archive, then delete the
    /// archived ones.
    ///
    /// Only rows present in the archive are deleted, so an event flushed
    /// between the two steps stays in the primary table until the next run.
    /// A crash between the steps leaves rows in both places.
    pub async fn archive_events(&self, cutoff: DateTime<Utc>) -> Result<ArchiveReport> {
        let archived = self.store.copy_to_archive(cutoff).await?;
        let deleted = self.store.delete_archived_before(cutoff).await?;
        if archived != deleted {
            debug!(
                "Archive copied {} events and deleted {} (cutoff {})",
                archived, deleted, cutoff
            );
        }
        info!("Archived {} audit events older than {}", archived, cutoff);
        Ok(ArchiveReport {
            cutoff,
            archived,
            deleted,
        })
    }
}

fn check_window(since: DateTime<Utc>, until: DateTime<Utc>) -> Result<()> {
    if since >= until {
        return Err(validation_error("'since' must be before 'until'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::models::{
        AnomalyKind, AuditEventType, AuditOutcome, AuditSeverity, EventDetails,
    };
    use crate::cache::MemoryCache;
    use crate::models::{Actor, ResourceRef};
    use crate::storage::MemoryStore;
    use crate::audit::models::AuditAggregate;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn trail() -> (AuditTrail, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let trail = AuditTrail::start(
            store.clone(),
            cache.clone(),
            AuditConfig {
                flush_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        (trail, store, cache)
    }

    fn input(event_type: AuditEventType, actor: &str) -> RecordEventInput {
        RecordEventInput::new(event_type, Actor::user(actor), "test_action")
    }

    #[tokio::test]
    async fn test_record_assigns_defaults_and_buffers() {
        let (trail, _store, _cache) = trail();
        let event = trail
            .record_event(input(AuditEventType::DataAccess, "alice"))
            .await
            .unwrap();
        assert_eq!(event.severity, AuditSeverity::Info);

        // Buffered, not yet durable
        assert!(trail.get_event(event.id).await.is_err());

        trail.flush().await.unwrap();
        assert_eq!(trail.get_event(event.id).await.unwrap(), event);
        trail.stop().await;
    }

    #[tokio::test]
    async fn test_stop_loses_nothing() {
        let (trail, store, _cache) = trail();
        let inputs = (0..25)
            .map(|i| input(AuditEventType::DataAccess, &format!("user-{}", i)))
            .collect();
        trail.record_events(inputs).await.unwrap();
        trail.stop().await;

        let all = store
            .search_events(&AuditFilter::default(), 0, 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 25);

        // Late writes go straight to storage
        trail
            .record_event(input(AuditEventType::SystemEvent, "late"))
            .await
            .unwrap();
        let all = store
            .search_events(&AuditFilter::default(), 0, 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 26);
    }

    #[tokio::test]
    async fn test_critical_events_publish_immediately() {
        let (trail, _store, _cache) = trail();
        let mut by_type = trail.subscribe("audit:type:breach_attempt").unwrap();
        let mut by_severity = trail.subscribe("audit:severity:critical").unwrap();
        let mut info_channel = trail.subscribe("audit:severity:info").unwrap();

        let event = trail
            .record_event(
                input(AuditEventType::BreachAttempt, "mallory").severity(AuditSeverity::Critical),
            )
            .await
            .unwrap();
        trail
            .record_event(input(AuditEventType::DataAccess, "alice"))
            .await
            .unwrap();

        let published: AuditEvent = serde_json::from_str(&by_type.recv().await.unwrap()).unwrap();
        assert_eq!(published.id, event.id);
        let published: AuditEvent =
            serde_json::from_str(&by_severity.recv().await.unwrap()).unwrap();
        assert_eq!(published.id, event.id);
        assert!(info_channel.try_recv().is_err());

        trail.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_rejects_foreign_channels() {
        let (trail, _store, _cache) = trail();
        assert!(trail.subscribe("ratelimit:x").is_err());
        trail.stop().await;
    }

    #[tokio::test]
    async fn test_search_filters_and_paginates() {
        let (trail, _store, _cache) = trail();
        for i in 0..7 {
            trail
                .record_event(
                    input(AuditEventType::AccessDenied, "bob")
                        .resource(ResourceRef::new("dataset", Some(format!("ds-{}", i))))
                        .outcome(AuditOutcome::Failure),
                )
                .await
                .unwrap();
        }
        trail
            .record_event(input(AuditEventType::AccessGranted, "bob"))
            .await
            .unwrap();
        trail.flush().await.unwrap();

        let filter = AuditFilter {
            event_type: Some(AuditEventType::AccessDenied),
            actor_id: Some("bob".to_string()),
            ..Default::default()
        };
        let first = trail
            .search_events(&filter, Pagination { offset: 0, limit: 5 })
            .await
            .unwrap();
        assert_eq!(first.items.len(), 5);
        assert!(first.has_more);

        let second = trail
            .search_events(&filter, Pagination { offset: 5, limit: 5 })
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(!second.has_more);

        let by_resource = AuditFilter {
            resource_id: Some("ds-3".to_string()),
            ..Default::default()
        };
        let page = trail
            .search_events(&by_resource, Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);

        assert!(trail
            .search_events(&filter, Pagination { offset: 0, limit: 0 })
            .await
            .is_err());
        trail.stop().await;
    }

    #[tokio::test]
    async fn test_statistics_and_anomalies() {
        let (trail, _store, _cache) = trail();
        let mut inputs = Vec::new();
        for _ in 0..6 {
            inputs.push(input(AuditEventType::LoginFailure, "eve").outcome(AuditOutcome::Failure));
        }
        for _ in 0..4 {
            inputs.push(input(AuditEventType::LoginSuccess, "alice").outcome(AuditOutcome::Success));
        }
        trail.record_events(inputs).await.unwrap();
        trail.flush().await.unwrap();

        let since = Utc::now() - ChronoDuration::hours(1);
        let until = Utc::now() + ChronoDuration::minutes(1);

        let stats = trail.get_statistics(since, until).await.unwrap();
        assert_eq!(stats.total, 10);
        assert!((stats.failure_rate - 0.6).abs() < f64::EPSILON);
        assert_eq!(stats.top_actors[0].actor_id, "eve");

        let anomalies = trail.detect_anomalies(since, until).await.unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::HighFailureRate);

        assert!(trail.get_statistics(until, since).await.is_err());
        trail.stop().await;
    }

    #[tokio::test]
    async fn test_archive_moves_old_rows() {
        let (trail, store, _cache) = trail();
        let old = input(AuditEventType::DataExport, "carol")
            .details(EventDetails::described("old export"))
            .into_event(Utc::now() - ChronoDuration::days(120));
        store.insert_events(&[old.clone()]).await.unwrap();

        trail
            .record_event(input(AuditEventType::DataExport, "carol"))
            .await
            .unwrap();
        trail.flush().await.unwrap();

        let cutoff = Utc::now() - ChronoDuration::days(90);
        let report = trail.archive_events(cutoff).await.unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.deleted, 1);

        assert!(trail.get_event(old.id).await.is_err());
        assert_eq!(store.archived_events().await, vec![old.clone()]);

        // Re-running a half-finished archive neither drops nor duplicates
        store.insert_events(&[old.clone()]).await.unwrap();
        store.copy_to_archive(cutoff).await.unwrap();
        let report = trail.archive_events(cutoff).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(report.deleted, 1);
        assert_eq!(store.archived_events().await, vec![old]);
        trail.stop().await;
    }

    /// Flushes a backdated event right after each archive copy
    struct LateFlushStore {
        inner: MemoryStore,
        late: Mutex<Option<AuditEvent>>,
    }

    #[async_trait]
    impl AuditStore for LateFlushStore {
        async fn insert_events(&self, events: &[AuditEvent]) -> Result<()> {
            self.inner.insert_events(events).await
        }

        async fn get_event(&self, id: Uuid) -> Result<Option<AuditEvent>> {
            self.inner.get_event(id).await
        }

        async fn search_events(
            &self,
            filter: &AuditFilter,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<AuditEvent>> {
            self.inner.search_events(filter, offset, limit).await
        }

        async fn aggregate_events(
            &self,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<AuditAggregate> {
            self.inner.aggregate_events(since, until).await
        }

        async fn copy_to_archive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            let copied = self.inner.copy_to_archive(cutoff).await?;
            if let Some(event) = self.late.lock().await.take() {
                self.inner.insert_events(&[event]).await?;
            }
            Ok(copied)
        }

        async fn delete_archived_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.inner.delete_archived_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_archive_keeps_events_flushed_mid_run() {
        let cutoff = Utc::now() - ChronoDuration::days(90);
        let late = input(AuditEventType::DataExport, "dave")
            .into_event(cutoff - ChronoDuration::seconds(1));
        let store = Arc::new(LateFlushStore {
            inner: MemoryStore::new(),
            late: Mutex::new(Some(late.clone())),
        });
        let trail = AuditTrail::start(
            store.clone(),
            Arc::new(MemoryCache::new()),
            AuditConfig::default(),
        );

        let report = trail.archive_events(cutoff).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(report.deleted, 0);
        assert_eq!(trail.get_event(late.id).await.unwrap(), late);

        // The next run archives it
        let report = trail.archive_events(cutoff).await.unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(store.inner.archived_events().await, vec![late]);
        trail.stop().await;
    }
}
