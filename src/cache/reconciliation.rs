//! Cache Reconciliation
//!
//! Startup and crash-recovery sweep that brings the index and a tenant
//! partition back in agreement:
//!
//! 1. **Index to disk**: entries whose local file is gone are deleted.
//! 2. **Disk to index**: files no entry points at are reported to the
//!    operator once each and left in place.
//!
//! Both passes work page by page on point-in-time snapshots and never hold a
//! lock across the whole tenant.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::filesystem::TenantCacheFilesystem;
use super::metrics::CacheMetrics;
use super::path_mapper::validate_checksum;
use crate::config::CacheConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    CacheIndex, CachedFileRecord, EventPublisher, PageRequest, TenantId, TenantResolver,
};
use crate::error::{Error, Result};

/// Outcome of one tenant sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Index entries examined
    pub checked_entries: u64,
    /// Index entries deleted because their file was missing
    pub removed_entries: u64,
    /// Index entries pointing outside the local filesystem, left untouched
    pub remote_entries: u64,
    /// Files found in the partition
    pub scanned_files: u64,
    /// Files reported because no index entry references them
    pub unindexed_files: u64,
    pub duration: Duration,
}

/// Outcome of a sweep over every active tenant
#[derive(Debug, Default)]
pub struct ReconcileAllReport {
    pub reconciled: BTreeMap<TenantId, ReconciliationReport>,
    pub failed: Vec<(TenantId, Error)>,
}

impl ReconcileAllReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Repairs divergence between the index and the cache directories.
pub struct CacheReconciliationService {
    index: Arc<dyn CacheIndex>,
    filesystem: Arc<TenantCacheFilesystem>,
    publisher: Arc<dyn EventPublisher>,
    resolver: Arc<dyn TenantResolver>,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
}

impl CacheReconciliationService {
    pub fn new(
        index: Arc<dyn CacheIndex>,
        filesystem: Arc<TenantCacheFilesystem>,
        publisher: Arc<dyn EventPublisher>,
        resolver: Arc<dyn TenantResolver>,
        config: Arc<CacheConfig>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            index,
            filesystem,
            publisher,
            resolver,
            config,
            metrics,
        }
    }

    /// Initialize the partition of a tenant whose connection just became
    /// ready, then reconcile it.
    pub async fn on_tenant_ready(&self, tenant: &TenantId) -> Result<ReconciliationReport> {
        self.filesystem.ensure_initialized(tenant).await?;
        self.reconcile(tenant).await
    }

    /// Initialize and reconcile every active tenant.
    ///
    /// A failing tenant is logged and recorded; the others still run.
    pub async fn reconcile_all(&self) -> Result<ReconcileAllReport> {
        let tenants = self.resolver.active_tenants().await?;
        let mut report = ReconcileAllReport::default();

        for tenant in tenants {
            match self.on_tenant_ready(&tenant).await {
                Ok(tenant_report) => {
                    report.reconciled.insert(tenant, tenant_report);
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(tenant = %tenant, "Cache partition unusable: {}", e);
                    } else {
                        warn!(tenant = %tenant, "Cache reconciliation failed: {}", e);
                    }
                    report.failed.push((tenant, e));
                }
            }
        }
        Ok(report)
    }

    /// Reconcile one tenant partition with its index entries.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn reconcile(&self, tenant: &TenantId) -> Result<ReconciliationReport> {
        let start = Instant::now();
        let mut report = ReconciliationReport::default();
        info!("Checking cache coherence between index and disk");

        self.remove_dirty_entries(tenant, &mut report).await?;
        self.report_unindexed_files(tenant, &mut report).await?;

        report.duration = start.elapsed();
        info!(
            removed_entries = report.removed_entries,
            unindexed_files = report.unindexed_files,
            duration_ms = report.duration.as_millis() as u64,
            "Cache coherence check done"
        );
        self.notify(DomainEvent::cache_reconciled(
            tenant,
            report.removed_entries,
            report.unindexed_files,
            report.duration,
        ))
        .await;
        Ok(report)
    }

    /// Pass 1: delete entries whose local file does not exist.
    async fn remove_dirty_entries(
        &self,
        tenant: &TenantId,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let mut page = Some(PageRequest::first(self.config.page_size));
        while let Some(request) = page {
            let records = self.index.find_all(tenant, &request).await?;
            for record in records.items {
                report.checked_entries += 1;
                if record.is_remote() {
                    report.remote_entries += 1;
                    continue;
                }
                if self.has_backing_file(&record).await {
                    continue;
                }
                if self
                    .index
                    .delete(tenant, &record.checksum, record.generation)
                    .await?
                {
                    debug!(
                        checksum = %record.checksum,
                        "Removed index entry without cached file"
                    );
                    report.removed_entries += 1;
                    self.metrics.record_dirty_entry_removed(tenant);
                    self.notify(DomainEvent::dirty_index_entry_removed(tenant, &record))
                        .await;
                }
            }
            self.index.flush(tenant).await?;
            page = records.next;
        }
        Ok(())
    }

    async fn has_backing_file(&self, record: &CachedFileRecord) -> bool {
        let Some(path) = record.local_path() else {
            return false;
        };
        match tokio::fs::try_exists(&path).await {
            Ok(exists) => exists,
            Err(e) => {
                // Unknown state: keep the entry
                warn!(
                    checksum = %record.checksum,
                    "Unable to check cached file {}: {}",
                    path.display(),
                    e
                );
                true
            }
        }
    }

    /// Pass 2: notify once for every file no entry points at.
    async fn report_unindexed_files(
        &self,
        tenant: &TenantId,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let referenced = self.referenced_paths(tenant).await?;

        let mut chunks = self.filesystem.walk_files(tenant, self.config.page_size)?;
        while let Some(chunk) = chunks.recv().await {
            let files = chunk?;
            report.scanned_files += files.len() as u64;

            let candidates: Vec<PathBuf> = files
                .into_iter()
                .filter(|path| !referenced.contains(path))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let admitted = self.admitted_since_snapshot(tenant, &candidates).await?;
            for path in candidates.iter().filter(|p| !admitted.contains(*p)) {
                warn!(
                    "File {} is present in cache directory while it shouldn't be",
                    path.display()
                );
                report.unindexed_files += 1;
                self.metrics.record_unindexed_file(tenant);
                self.notify(DomainEvent::unindexed_cache_file(tenant, path))
                    .await;
            }
        }
        Ok(())
    }

    /// Local paths referenced by any index entry of the tenant.
    async fn referenced_paths(&self, tenant: &TenantId) -> Result<HashSet<PathBuf>> {
        let mut paths = HashSet::new();
        let mut page = Some(PageRequest::first(self.config.page_size));
        while let Some(request) = page {
            let records = self.index.find_all(tenant, &request).await?;
            paths.extend(records.items.iter().filter_map(CachedFileRecord::local_path));
            page = records.next;
        }
        Ok(paths)
    }

    /// Candidates an entry started pointing at after `referenced_paths` ran,
    /// looked up by file name with one bulk query.
    async fn admitted_since_snapshot(
        &self,
        tenant: &TenantId,
        candidates: &[PathBuf],
    ) -> Result<HashSet<PathBuf>> {
        let checksums: HashSet<String> = candidates
            .iter()
            .filter_map(|path| file_checksum(path))
            .collect();
        if checksums.is_empty() {
            return Ok(HashSet::new());
        }

        let locations: HashSet<PathBuf> = self
            .index
            .find_all_by_checksums(tenant, &checksums)
            .await?
            .iter()
            .filter_map(CachedFileRecord::local_path)
            .collect();

        Ok(candidates
            .iter()
            .filter(|path| locations.contains(*path))
            .cloned()
            .collect())
    }

    async fn notify(&self, event: DomainEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!("Failed to publish cache notification: {}", e);
        }
    }
}

impl std::fmt::Debug for CacheReconciliationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReconciliationService")
            .field("cache_root", &self.filesystem.mapper().cache_root())
            .field("page_size", &self.config.page_size)
            .finish()
    }
}

/// Checksum a cached file is named after, if its name can be one.
fn file_checksum(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    validate_checksum(name).ok()?;
    Some(name.to_string())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCacheIndex, InMemoryEventCollector, StaticTenantResolver};
    use crate::cache::path_mapper::ContentAddressedPathMapper;
    use assert_matches::assert_matches;
    use chrono::{Duration as ChronoDuration, Utc};
    use url::Url;

    struct Fixture {
        dir: tempfile::TempDir,
        index: Arc<InMemoryCacheIndex>,
        filesystem: Arc<TenantCacheFilesystem>,
        events: Arc<InMemoryEventCollector>,
        service: CacheReconciliationService,
        tenant: TenantId,
    }

    async fn fixture(page_size: usize, tenants: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::with_root(dir.path());
        config.page_size = page_size;
        let config = Arc::new(config);

        let filesystem = Arc::new(TenantCacheFilesystem::new(ContentAddressedPathMapper::new(
            dir.path(),
            config.path_depth,
        )));
        let tenant = TenantId::new("tenantX");
        filesystem.ensure_initialized(&tenant).await.unwrap();

        let index = Arc::new(InMemoryCacheIndex::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let service = CacheReconciliationService::new(
            index.clone(),
            filesystem.clone(),
            events.clone(),
            Arc::new(StaticTenantResolver::new(tenants.iter().copied())),
            config,
            Arc::new(CacheMetrics::new()),
        );
        Fixture {
            dir,
            index,
            filesystem,
            events,
            service,
            tenant,
        }
    }

    impl Fixture {
        async fn cached(&self, checksum: &str, on_disk: bool) {
            let path = self.filesystem.path_for(&self.tenant, checksum).unwrap();
            if on_disk {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, checksum).unwrap();
            }
            self.index
                .upsert(
                    &self.tenant,
                    CachedFileRecord::new(
                        checksum,
                        checksum.len() as u64,
                        Some(Url::from_file_path(&path).unwrap()),
                        Utc::now() + ChronoDuration::hours(1),
                    ),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unindexed_file_is_reported_once_and_kept() {
        let f = fixture(10, &["tenantX"]).await;
        let stray = f.dir.path().join("tenantX").join("foo.bin");
        std::fs::write(&stray, b"stray").unwrap();

        let report = f.service.reconcile(&f.tenant).await.unwrap();

        assert_eq!(report.unindexed_files, 1);
        assert_eq!(report.removed_entries, 0);
        assert!(stray.exists());
        assert!(f.index.snapshot(&f.tenant).is_empty());

        let notifications = f.events.notifications();
        assert_eq!(notifications.len(), 1);
        assert_matches!(
            &notifications[0],
            DomainEvent::UnindexedCacheFile { title, path, .. }
                if title == "Dirty cache" && path.ends_with("foo.bin")
        );
    }

    #[tokio::test]
    async fn test_index_and_disk_converge() {
        // Small pages so both passes span several pages
        let f = fixture(2, &["tenantX"]).await;
        for checksum in ["aa01", "bb02", "cc03"] {
            f.cached(checksum, true).await;
        }
        for checksum in ["dd04", "ee05", "ff06"] {
            f.cached(checksum, false).await;
        }
        // Right name, wrong place: still unindexed
        let misplaced = f.dir.path().join("tenantX").join("aa01");
        std::fs::write(&misplaced, b"copy").unwrap();
        std::fs::write(f.dir.path().join("tenantX").join("zz99"), b"orphan").unwrap();

        let report = f.service.reconcile(&f.tenant).await.unwrap();

        assert_eq!(report.checked_entries, 6);
        assert_eq!(report.removed_entries, 3);
        assert_eq!(report.scanned_files, 5);
        assert_eq!(report.unindexed_files, 2);

        let remaining: Vec<_> = f
            .index
            .snapshot(&f.tenant)
            .into_iter()
            .map(|r| r.checksum)
            .collect();
        assert_eq!(remaining, vec!["aa01", "bb02", "cc03"]);
        for record in f.index.snapshot(&f.tenant) {
            assert!(record.local_path().unwrap().exists());
        }
        assert_eq!(f.events.events_of_type("DirtyIndexEntryRemoved").len(), 3);
        assert_eq!(f.events.notifications().len(), 2);

        // A second sweep finds nothing new to remove
        let again = f.service.reconcile(&f.tenant).await.unwrap();
        assert_eq!(again.removed_entries, 0);
    }

    #[tokio::test]
    async fn test_file_referenced_under_another_name_is_indexed() {
        let f = fixture(2, &["tenantX"]).await;
        let restored = f.dir.path().join("tenantX").join("restored.bin");
        std::fs::write(&restored, b"payload").unwrap();
        f.index
            .upsert(
                &f.tenant,
                CachedFileRecord::new(
                    "abc123",
                    7,
                    Some(Url::from_file_path(&restored).unwrap()),
                    Utc::now() + ChronoDuration::hours(1),
                ),
            )
            .await
            .unwrap();
        f.cached("bb02", true).await;
        f.cached("cc03", true).await;

        let report = f.service.reconcile(&f.tenant).await.unwrap();

        assert_eq!(report.removed_entries, 0);
        assert_eq!(report.scanned_files, 3);
        assert_eq!(report.unindexed_files, 0);
        assert!(f.events.notifications().is_empty());
        assert!(restored.exists());
    }

    #[tokio::test]
    async fn test_remote_and_empty_locations() {
        let f = fixture(10, &["tenantX"]).await;
        let expiration = Utc::now() + ChronoDuration::hours(1);
        f.index
            .upsert(
                &f.tenant,
                CachedFileRecord::new(
                    "remote1",
                    1,
                    Some(Url::parse("s3://bucket/remote1").unwrap()),
                    expiration,
                ),
            )
            .await
            .unwrap();
        f.index
            .upsert(&f.tenant, CachedFileRecord::new("nowhere", 1, None, expiration))
            .await
            .unwrap();

        let report = f.service.reconcile(&f.tenant).await.unwrap();

        assert_eq!(report.remote_entries, 1);
        assert_eq!(report.removed_entries, 1);
        assert!(f
            .index
            .find_by_checksum(&f.tenant, "remote1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_reconcile_all_isolates_failing_tenant() {
        let f = fixture(10, &["tenantX", "broken"]).await;
        std::fs::write(f.dir.path().join("broken"), b"not a directory").unwrap();

        let report = f.service.reconcile_all().await.unwrap();

        assert!(!report.is_success());
        assert!(report.reconciled.contains_key(&f.tenant));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, TenantId::new("broken"));
        assert!(report.failed[0].1.is_fatal());
    }

    #[tokio::test]
    async fn test_on_tenant_ready_initializes_partition() {
        let f = fixture(10, &[]).await;
        let tenant = TenantId::new("late");

        f.service.on_tenant_ready(&tenant).await.unwrap();

        assert!(f.filesystem.is_initialized(&tenant));
        assert!(f.dir.path().join("late").is_dir());
    }
}
