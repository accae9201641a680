//! Event Publisher Adapter
//!
//! Implements the `EventPublisher` port with various backends.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::events::{DomainEvent, NotificationLevel};
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Logging-based event publisher.
///
/// Audit events go to info or debug depending on construction. Operator
/// notifications use their own level, purge failures always warn.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    audit_at_info: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log audit events at info level.
    pub fn info_level() -> Self {
        Self { audit_at_info: true }
    }

    /// Log audit events at debug level.
    pub fn debug_level() -> Self {
        Self {
            audit_at_info: false,
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let tenant = event.tenant();

        match &event {
            DomainEvent::UnindexedCacheFile {
                path,
                title,
                message,
                level,
                ..
            } => match level {
                NotificationLevel::Error => {
                    error!(tenant = %tenant, path = %path, title = %title, "{}", message)
                }
                NotificationLevel::Warning => {
                    warn!(tenant = %tenant, path = %path, title = %title, "{}", message)
                }
                NotificationLevel::Info => {
                    info!(tenant = %tenant, path = %path, title = %title, "{}", message)
                }
            },
            DomainEvent::CachePurgeFailed {
                checksum,
                path,
                reason,
                ..
            } => {
                warn!(
                    tenant = %tenant,
                    checksum = %checksum,
                    path = %path,
                    "Cached file could not be purged: {}", reason
                );
            }
            _ => {
                let checksum = event.checksum().unwrap_or("-");
                let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));
                if self.audit_at_info {
                    info!(event_type, tenant = %tenant, checksum = %checksum, event = %json, "Cache event");
                } else {
                    debug!(event_type, tenant = %tenant, checksum = %checksum, event = %json, "Cache event");
                }
            }
        }

        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Collects events in memory for inspection in tests.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: Mutex<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Events with the given type name, in publication order.
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.filtered(|e| e.event_type() == event_type)
    }

    /// Events concerning one cached checksum.
    pub fn events_for_checksum(&self, checksum: &str) -> Vec<DomainEvent> {
        self.filtered(|e| e.checksum() == Some(checksum))
    }

    /// Events raised for one tenant partition.
    pub fn events_for_tenant(&self, tenant: &str) -> Vec<DomainEvent> {
        self.filtered(|e| e.tenant() == tenant)
    }

    /// Operator notifications only.
    pub fn notifications(&self) -> Vec<DomainEvent> {
        self.filtered(DomainEvent::is_operator_notification)
    }

    fn filtered(&self, keep: impl Fn(&DomainEvent) -> bool) -> Vec<DomainEvent> {
        self.events.lock().iter().filter(|e| keep(e)).cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.lock().extend(events);
        Ok(())
    }
}

/// Delivers every event to each inner publisher.
///
/// A failing publisher does not stop delivery to the others; the first
/// error is returned once all of them have been tried.
#[derive(Default, Clone)]
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publishers", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event.clone()).await {
                warn!(event_type = event.event_type(), "Event publisher failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_all(events.clone()).await {
                warn!(events = events.len(), "Event publisher failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{CachedFileRecord, TenantId};
    use crate::error::Error;
    use chrono::Utc;
    use std::path::Path;

    fn added(checksum: &str) -> DomainEvent {
        let record = CachedFileRecord::new(checksum, 1024, None, Utc::now());
        DomainEvent::cache_file_added(&TenantId::new("project1"), &record, true)
    }

    fn unindexed(tenant: &str) -> DomainEvent {
        DomainEvent::unindexed_cache_file(&TenantId::new(tenant), Path::new("/cache/p/foo.bin"))
    }

    struct Rejecting;

    #[async_trait]
    impl EventPublisher for Rejecting {
        async fn publish(&self, _event: DomainEvent) -> Result<()> {
            Err(Error::Internal("sink closed".into()))
        }

        async fn publish_all(&self, _events: Vec<DomainEvent>) -> Result<()> {
            Err(Error::Internal("sink closed".into()))
        }
    }

    #[tokio::test]
    async fn test_logging_publisher_accepts_every_kind() {
        let publisher = LoggingEventPublisher::debug_level();
        let record = CachedFileRecord::new("abc", 10, None, Utc::now());
        let tenant = TenantId::new("project1");

        publisher
            .publish_all(vec![
                added("abc"),
                unindexed("project1"),
                DomainEvent::cache_purge_failed(&tenant, &record, Path::new("/x"), "busy"),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collector_filters() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector.publish(added("c1")).await.unwrap();
        collector.publish(added("c2")).await.unwrap();
        collector.publish(unindexed("project2")).await.unwrap();

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.events_of_type("CacheFileAdded").len(), 2);
        assert_eq!(collector.events_for_checksum("c2").len(), 1);
        assert_eq!(collector.events_for_tenant("project1").len(), 2);
        assert_eq!(collector.notifications().len(), 1);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_composite_delivers_past_failing_publisher() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventPublisher::new()
            .with_publisher(Arc::new(Rejecting))
            .with_publisher(collector.clone());

        let result = composite.publish(added("abc")).await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(collector.len(), 1);

        let result = composite.publish_all(vec![added("d"), added("e")]).await;
        assert!(result.is_err());
        assert_eq!(collector.len(), 3);
    }
}
