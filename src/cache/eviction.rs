//! Cache Eviction
//!
//! Expiration-driven purge of cached files, plus explicit and size-driven
//! removal. An index entry is removed only once its file is confirmed gone
//! from disk; a file that cannot be deleted keeps its entry and is retried on
//! the next pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::filesystem::{FileRemoval, TenantCacheFilesystem};
use super::metrics::CacheMetrics;
use super::policy::{OldestExpirationFirst, VictimSelector};
use crate::config::CacheConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{CacheIndex, CachedFileRecord, EventPublisher, PageRequest, TenantId};
use crate::error::Result;

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Index entries removed
    pub purged: u64,
    /// Bytes released from the index
    pub purged_bytes: u64,
    /// Purged entries whose file was already gone
    pub missing_files: u64,
    /// Entries kept because their file could not be deleted
    pub retained: u64,
    /// Entries refreshed or removed by someone else before they were purged
    pub superseded: u64,
}

impl PurgeReport {
    pub fn merge(&mut self, other: &PurgeReport) {
        self.purged += other.purged;
        self.purged_bytes += other.purged_bytes;
        self.missing_files += other.missing_files;
        self.retained += other.retained;
        self.superseded += other.superseded;
    }

    fn record(&mut self, outcome: &PurgeOutcome) {
        match outcome {
            PurgeOutcome::Purged {
                size_bytes,
                file_existed,
            } => {
                self.purged += 1;
                self.purged_bytes += size_bytes;
                if !file_existed {
                    self.missing_files += 1;
                }
            }
            PurgeOutcome::Retained => self.retained += 1,
            PurgeOutcome::Superseded => self.superseded += 1,
        }
    }
}

/// What a single record purge did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged { size_bytes: u64, file_existed: bool },
    Retained,
    Superseded,
}

/// Condition the stored record must still meet right before deletion
#[derive(Debug, Clone, Copy)]
enum PurgeGuard {
    /// Still expired with respect to the pass cutoff
    ExpiredBefore(DateTime<Utc>),
    /// Not modified since it was selected
    Unchanged(u64),
    /// Still present
    Present,
}

impl PurgeGuard {
    fn allows(&self, current: &CachedFileRecord) -> bool {
        match self {
            PurgeGuard::ExpiredBefore(cutoff) => current.expiration_date < *cutoff,
            PurgeGuard::Unchanged(generation) => current.generation == *generation,
            PurgeGuard::Present => true,
        }
    }
}

/// Removes cached files and their index entries.
pub struct EvictionService {
    index: Arc<dyn CacheIndex>,
    filesystem: Arc<TenantCacheFilesystem>,
    publisher: Arc<dyn EventPublisher>,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
    selector: Arc<dyn VictimSelector>,
}

impl EvictionService {
    pub fn new(
        index: Arc<dyn CacheIndex>,
        filesystem: Arc<TenantCacheFilesystem>,
        publisher: Arc<dyn EventPublisher>,
        config: Arc<CacheConfig>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let selector = Arc::new(OldestExpirationFirst::new(index.clone(), config.page_size));
        Self {
            index,
            filesystem,
            publisher,
            config,
            metrics,
            selector,
        }
    }

    /// Replace the size-driven victim selection policy.
    pub fn with_victim_selector(mut self, selector: Arc<dyn VictimSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Purge every record of the tenant that expired before this call started.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn purge_expired(&self, tenant: &TenantId) -> Result<PurgeReport> {
        let partition = self.filesystem.tenant_root(tenant)?;
        let cutoff = Utc::now();
        let guard = PurgeGuard::ExpiredBefore(cutoff);
        let mut report = PurgeReport::default();

        debug!(
            "Deleting files expired before {} from {}",
            cutoff,
            partition.display()
        );
        let mut page = Some(PageRequest::first(self.config.page_size));
        while let Some(request) = page {
            let expired = self
                .index
                .find_expired_before(tenant, cutoff, &request)
                .await?;
            for record in expired.items {
                let outcome = self.purge_or_retain(tenant, record, guard).await;
                report.record(&outcome);
            }
            self.index.flush(tenant).await?;
            page = expired.next;
        }

        if report.purged > 0 || report.retained > 0 {
            info!(
                purged = report.purged,
                retained = report.retained,
                missing = report.missing_files,
                "Expired cache files purged"
            );
        }
        Ok(report)
    }

    /// Remove one record and its file, whatever its expiration.
    pub async fn delete(&self, tenant: &TenantId, record: CachedFileRecord) -> Result<bool> {
        let outcome = self.purge_record(tenant, record, PurgeGuard::Present).await?;
        self.index.flush(tenant).await?;
        Ok(matches!(outcome, PurgeOutcome::Purged { .. }))
    }

    /// Remove a set of records and their files.
    #[instrument(skip(self, tenant, records), fields(tenant = %tenant, records = records.len()))]
    pub async fn delete_cached_files(
        &self,
        tenant: &TenantId,
        records: Vec<CachedFileRecord>,
    ) -> PurgeReport {
        let mut report = PurgeReport::default();
        for record in records {
            let outcome = self.purge_or_retain(tenant, record, PurgeGuard::Present).await;
            report.record(&outcome);
        }
        self.flush_or_warn(tenant).await;
        report
    }

    /// Evict unexpired records until the tenant is back within its quota.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn purge_to_quota(&self, tenant: &TenantId) -> Result<PurgeReport> {
        let used = self.index.total_size_bytes(tenant).await?;
        let quota = self.config.quota_bytes(tenant);
        let mut report = PurgeReport::default();
        if used <= quota {
            return Ok(report);
        }

        let to_free = used - quota;
        let victims = self.selector.select_victims(tenant, to_free).await?;
        info!(
            policy = self.selector.name(),
            used,
            quota,
            victims = victims.len(),
            "Cache over quota, evicting unexpired files"
        );
        for record in victims {
            let guard = PurgeGuard::Unchanged(record.generation);
            let outcome = self.purge_or_retain(tenant, record, guard).await;
            report.record(&outcome);
        }
        self.index.flush(tenant).await?;
        Ok(report)
    }

    /// Purge one record, containing any index error to this record.
    async fn purge_or_retain(
        &self,
        tenant: &TenantId,
        record: CachedFileRecord,
        guard: PurgeGuard,
    ) -> PurgeOutcome {
        let checksum = record.checksum.clone();
        match self.purge_record(tenant, record, guard).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(tenant = %tenant, checksum = %checksum, "Unable to purge cache file: {}", e);
                self.metrics.record_purge_failure(tenant);
                PurgeOutcome::Retained
            }
        }
    }

    async fn purge_record(
        &self,
        tenant: &TenantId,
        record: CachedFileRecord,
        guard: PurgeGuard,
    ) -> Result<PurgeOutcome> {
        // Re-read: a concurrent add_file may have extended the record
        let current = match self.index.find_by_checksum(tenant, &record.checksum).await? {
            Some(current) if guard.allows(&current) => current,
            _ => return Ok(PurgeOutcome::Superseded),
        };

        let file_existed = match current.local_path() {
            None => false,
            Some(path) => match self
                .filesystem
                .remove_file(&path, self.config.file_delete_timeout)
                .await
            {
                FileRemoval::Removed => true,
                FileRemoval::Missing => {
                    debug!(
                        tenant = %tenant,
                        checksum = %current.checksum,
                        "File {} already deleted",
                        path.display()
                    );
                    false
                }
                FileRemoval::Failed(reason) => {
                    warn!(
                        tenant = %tenant,
                        checksum = %current.checksum,
                        "Error deleting file {}: {}",
                        path.display(),
                        reason
                    );
                    self.metrics.record_purge_failure(tenant);
                    self.notify(DomainEvent::cache_purge_failed(tenant, &current, &path, reason))
                        .await;
                    return Ok(PurgeOutcome::Retained);
                }
            },
        };

        if !self
            .index
            .delete(tenant, &current.checksum, current.generation)
            .await?
        {
            warn!(
                tenant = %tenant,
                checksum = %current.checksum,
                "Cache file was refreshed while being purged"
            );
            return Ok(PurgeOutcome::Superseded);
        }

        self.metrics.record_purge(tenant, current.size_bytes);
        self.notify(DomainEvent::cache_file_purged(tenant, &current, file_existed))
            .await;
        Ok(PurgeOutcome::Purged {
            size_bytes: current.size_bytes,
            file_existed,
        })
    }

    async fn flush_or_warn(&self, tenant: &TenantId) {
        if let Err(e) = self.index.flush(tenant).await {
            warn!(tenant = %tenant, "Unable to flush cache index: {}", e);
        }
    }

    async fn notify(&self, event: DomainEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!("Failed to publish cache event: {}", e);
        }
    }
}

impl std::fmt::Debug for EvictionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionService")
            .field("policy", &self.selector.name())
            .field("page_size", &self.config.page_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCacheIndex, InMemoryEventCollector};
    use crate::cache::path_mapper::ContentAddressedPathMapper;
    use chrono::Duration;
    use url::Url;

    struct Fixture {
        _dir: tempfile::TempDir,
        index: Arc<InMemoryCacheIndex>,
        filesystem: Arc<TenantCacheFilesystem>,
        events: Arc<InMemoryEventCollector>,
        service: EvictionService,
        tenant: TenantId,
    }

    async fn fixture(page_size: usize, quota_kb: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::with_root(dir.path());
        config.page_size = page_size;
        config.default_quota_kb = quota_kb;
        let config = Arc::new(config);

        let filesystem = Arc::new(TenantCacheFilesystem::new(ContentAddressedPathMapper::new(
            dir.path(),
            config.path_depth,
        )));
        let tenant = TenantId::new("tenantX");
        filesystem.ensure_initialized(&tenant).await.unwrap();

        let index = Arc::new(InMemoryCacheIndex::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let service = EvictionService::new(
            index.clone(),
            filesystem.clone(),
            events.clone(),
            config,
            Arc::new(CacheMetrics::new()),
        );
        Fixture {
            _dir: dir,
            index,
            filesystem,
            events,
            service,
            tenant,
        }
    }

    impl Fixture {
        /// Index a record and, when `on_disk`, materialize its file.
        async fn cached(&self, checksum: &str, size: u64, hours: i64, on_disk: bool) {
            let path = self.filesystem.path_for(&self.tenant, checksum).unwrap();
            if on_disk {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, vec![0u8; size as usize]).unwrap();
            }
            let location = Url::from_file_path(&path).unwrap();
            self.index
                .upsert(
                    &self.tenant,
                    CachedFileRecord::new(
                        checksum,
                        size,
                        Some(location),
                        Utc::now() + Duration::hours(hours),
                    ),
                )
                .await
                .unwrap();
        }

        fn file_exists(&self, checksum: &str) -> bool {
            self.filesystem
                .path_for(&self.tenant, checksum)
                .unwrap()
                .exists()
        }
    }

    #[tokio::test]
    async fn test_purge_expired_removes_file_and_entry() {
        let f = fixture(2, 1024).await;
        f.cached("aa01", 10, -1, true).await;
        f.cached("bb02", 10, -2, true).await;
        f.cached("cc03", 10, -3, true).await;
        f.cached("dd04", 10, 1, true).await;

        let report = f.service.purge_expired(&f.tenant).await.unwrap();

        assert_eq!(report.purged, 3);
        assert_eq!(report.purged_bytes, 30);
        assert_eq!(report.missing_files, 0);
        for checksum in ["aa01", "bb02", "cc03"] {
            assert!(!f.file_exists(checksum));
        }
        assert!(f.file_exists("dd04"));
        let remaining = f.index.snapshot(&f.tenant);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].checksum, "dd04");
        assert_eq!(f.events.events_of_type("CacheFilePurged").len(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_counts_as_purged() {
        let f = fixture(10, 1024).await;
        f.cached("c1", 10, -1, false).await;

        let report = f.service.purge_expired(&f.tenant).await.unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(report.missing_files, 1);
        assert!(f.index.find_by_checksum(&f.tenant, "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undeletable_file_keeps_entry() {
        let f = fixture(10, 1024).await;
        f.cached("ab12", 10, -1, false).await;
        // A non-empty directory where the file should be cannot be unlinked
        let path = f.filesystem.path_for(&f.tenant, "ab12").unwrap();
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        let report = f.service.purge_expired(&f.tenant).await.unwrap();

        assert_eq!(report.purged, 0);
        assert_eq!(report.retained, 1);
        assert!(f.index.find_by_checksum(&f.tenant, "ab12").await.unwrap().is_some());
        assert_eq!(f.events.events_of_type("CachePurgeFailed").len(), 1);

        // Retried on the next pass once the obstacle is gone
        std::fs::remove_dir_all(&path).unwrap();
        let report = f.service.purge_expired(&f.tenant).await.unwrap();
        assert_eq!(report.purged, 1);
    }

    #[tokio::test]
    async fn test_record_without_location_only_drops_entry() {
        let f = fixture(10, 1024).await;
        f.index
            .upsert(
                &f.tenant,
                CachedFileRecord::new("nolocation", 5, None, Utc::now() - Duration::hours(1)),
            )
            .await
            .unwrap();

        let report = f.service.purge_expired(&f.tenant).await.unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(f.index.snapshot(&f.tenant).len(), 0);
    }

    #[tokio::test]
    async fn test_delete_explicit_records() {
        let f = fixture(10, 1024).await;
        f.cached("aa01", 10, 5, true).await;
        f.cached("bb02", 10, 5, true).await;

        let record = f.index.find_by_checksum(&f.tenant, "aa01").await.unwrap().unwrap();
        assert!(f.service.delete(&f.tenant, record.clone()).await.unwrap());
        assert!(!f.service.delete(&f.tenant, record).await.unwrap());
        assert!(!f.file_exists("aa01"));

        let rest = f.index.snapshot(&f.tenant);
        let report = f.service.delete_cached_files(&f.tenant, rest).await;
        assert_eq!(report.purged, 1);
        assert!(!f.file_exists("bb02"));
    }

    #[tokio::test]
    async fn test_purge_to_quota_evicts_soonest_expiring() {
        // Quota 1 KiB, 1536 bytes indexed
        let f = fixture(10, 1).await;
        f.cached("aa01", 512, 3, true).await;
        f.cached("bb02", 512, 1, true).await;
        f.cached("cc03", 512, 2, true).await;

        let report = f.service.purge_to_quota(&f.tenant).await.unwrap();

        assert_eq!(report.purged, 1);
        assert!(!f.file_exists("bb02"));
        assert!(f.file_exists("aa01"));
        assert_eq!(f.index.total_size_bytes(&f.tenant).await.unwrap(), 1024);

        let report = f.service.purge_to_quota(&f.tenant).await.unwrap();
        assert_eq!(report, PurgeReport::default());
    }
}
