//! Cache Admission
//!
//! Lookup, add/update and capacity accounting for cached files. Every
//! mutation here is index-only: the retrieval pipeline materializes the file
//! at [`CacheAdmissionService::file_path`] and then records it with
//! [`CacheAdmissionService::add_file`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use url::Url;

use super::filesystem::TenantCacheFilesystem;
use super::metrics::CacheMetrics;
use super::path_mapper::validate_checksum;
use crate::config::{CacheConfig, CACHE_NAME};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    CacheIndex, CachedFileRecord, EventPublisher, FileReference, TenantId, UpsertOutcome,
};
use crate::error::{Error, Result};

/// Compare-and-swap attempts before giving up on a contended record
pub const MAX_UPSERT_ATTEMPTS: u32 = 16;

/// A file the retrieval pipeline just materialized in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCachedFile {
    pub checksum: String,
    pub size_bytes: u64,
    pub location: Url,
    pub expiration_date: DateTime<Utc>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_type: Option<String>,
    pub group_id: Option<String>,
}

impl NewCachedFile {
    pub fn new(
        checksum: impl Into<String>,
        size_bytes: u64,
        location: Url,
        expiration_date: DateTime<Utc>,
    ) -> Self {
        Self {
            checksum: checksum.into(),
            size_bytes,
            location,
            expiration_date,
            file_name: None,
            mime_type: None,
            file_type: None,
            group_id: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    fn into_record(self) -> CachedFileRecord {
        let mut record = CachedFileRecord::new(
            self.checksum,
            self.size_bytes,
            Some(self.location),
            self.expiration_date,
        );
        record.file_name = self.file_name;
        record.mime_type = self.mime_type;
        record.file_type = self.file_type;
        record.group_ids.extend(self.group_id);
        record
    }

    /// Fold this admission into an already stored record.
    fn merge_into(&self, record: &mut CachedFileRecord) {
        record.size_bytes = self.size_bytes;
        if self.expiration_date > record.expiration_date {
            record.expiration_date = self.expiration_date;
        }
        if record.location.is_none() {
            record.location = Some(self.location.clone());
        }
        if let Some(file_name) = &self.file_name {
            record.file_name = Some(file_name.clone());
        }
        if let Some(mime_type) = &self.mime_type {
            record.mime_type = Some(mime_type.clone());
        }
        if let Some(file_type) = &self.file_type {
            record.file_type = Some(file_type.clone());
        }
        if let Some(group_id) = &self.group_id {
            record.group_ids.insert(group_id.clone());
        }
    }
}

/// The cache described as a storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheLocationStats {
    pub name: String,
    pub total_files: u64,
    pub used_kb: u64,
    pub quota_kb: u64,
    pub available_bytes: i64,
}

/// Index-side admission and capacity accounting.
pub struct CacheAdmissionService {
    index: Arc<dyn CacheIndex>,
    filesystem: Arc<TenantCacheFilesystem>,
    publisher: Arc<dyn EventPublisher>,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
}

impl CacheAdmissionService {
    pub fn new(
        index: Arc<dyn CacheIndex>,
        filesystem: Arc<TenantCacheFilesystem>,
        publisher: Arc<dyn EventPublisher>,
        config: Arc<CacheConfig>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            index,
            filesystem,
            publisher,
            config,
            metrics,
        }
    }

    /// Record a materialized file, creating or refreshing its index entry.
    ///
    /// Expiration only moves forward; size is always the latest reported.
    #[instrument(skip(self, tenant, file), fields(tenant = %tenant, checksum = %file.checksum))]
    pub async fn add_file(&self, tenant: &TenantId, file: NewCachedFile) -> Result<CachedFileRecord> {
        validate_checksum(&file.checksum)?;
        if !self.filesystem.is_initialized(tenant) {
            return Err(Error::TenantNotInitialized(tenant.to_string()));
        }

        for attempt in 1..=MAX_UPSERT_ATTEMPTS {
            let existing = self.index.find_by_checksum(tenant, &file.checksum).await?;
            let created = existing.is_none();
            let candidate = match existing {
                Some(mut record) => {
                    file.merge_into(&mut record);
                    record
                }
                None => file.clone().into_record(),
            };

            match self.index.upsert(tenant, candidate).await? {
                UpsertOutcome::Stored(record) => {
                    debug!(
                        created,
                        size_bytes = record.size_bytes,
                        expiration_date = %record.expiration_date,
                        "Cache file recorded"
                    );
                    self.metrics.record_admission(tenant);
                    self.notify(DomainEvent::cache_file_added(tenant, &record, created))
                        .await;
                    return Ok(record);
                }
                UpsertOutcome::Conflict => {
                    debug!(attempt, "Concurrent update of cache file, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }

        Err(Error::ConcurrentModification {
            tenant: tenant.to_string(),
            checksum: file.checksum,
            attempts: MAX_UPSERT_ATTEMPTS,
        })
    }

    /// Look up the cached file of a checksum.
    pub async fn search(&self, tenant: &TenantId, checksum: &str) -> Result<Option<CachedFileRecord>> {
        let found = self.index.find_by_checksum(tenant, checksum).await?;
        if found.is_some() {
            self.metrics.record_hit(tenant);
        } else {
            self.metrics.record_miss(tenant);
        }
        Ok(found)
    }

    pub async fn get_available(
        &self,
        tenant: &TenantId,
        file: &FileReference,
    ) -> Result<Option<CachedFileRecord>> {
        self.search(tenant, &file.checksum).await
    }

    /// Subset of `files` already present in the cache, resolved with one query.
    pub async fn get_availables(
        &self,
        tenant: &TenantId,
        files: &HashSet<FileReference>,
    ) -> Result<HashSet<FileReference>> {
        let records = self.find_all(tenant, files).await?;
        let cached: HashSet<&str> = records.iter().map(|r| r.checksum.as_str()).collect();
        Ok(files
            .iter()
            .filter(|f| cached.contains(f.checksum.as_str()))
            .cloned()
            .collect())
    }

    /// Like [`get_availables`](Self::get_availables), and attach `group_id` to
    /// every matched record so the availability request stays traceable.
    #[instrument(skip(self, tenant, files), fields(tenant = %tenant, files = files.len()))]
    pub async fn register_availables(
        &self,
        tenant: &TenantId,
        files: &HashSet<FileReference>,
        group_id: &str,
    ) -> Result<HashSet<FileReference>> {
        let records = self.find_all(tenant, files).await?;
        let mut available = HashSet::new();

        for record in records {
            let checksum = record.checksum.clone();
            if !record.group_ids.contains(group_id) {
                self.add_group(tenant, record, group_id).await?;
            }
            available.extend(files.iter().filter(|f| f.checksum == checksum).cloned());
        }
        Ok(available)
    }

    async fn add_group(
        &self,
        tenant: &TenantId,
        mut record: CachedFileRecord,
        group_id: &str,
    ) -> Result<()> {
        for _ in 0..MAX_UPSERT_ATTEMPTS {
            record.group_ids.insert(group_id.to_string());
            if let UpsertOutcome::Stored(_) = self.index.upsert(tenant, record.clone()).await? {
                return Ok(());
            }
            match self.index.find_by_checksum(tenant, &record.checksum).await? {
                Some(latest) => record = latest,
                // Evicted in between: nothing left to tag
                None => return Ok(()),
            }
        }
        Err(Error::ConcurrentModification {
            tenant: tenant.to_string(),
            checksum: record.checksum,
            attempts: MAX_UPSERT_ATTEMPTS,
        })
    }

    async fn find_all(
        &self,
        tenant: &TenantId,
        files: &HashSet<FileReference>,
    ) -> Result<Vec<CachedFileRecord>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let checksums: HashSet<String> = files.iter().map(|f| f.checksum.clone()).collect();
        self.index.find_all_by_checksums(tenant, &checksums).await
    }

    /// Bytes accounted to the tenant in the index.
    pub async fn used_bytes(&self, tenant: &TenantId) -> Result<u64> {
        let used = self.index.total_size_bytes(tenant).await?;
        self.metrics.update_used_bytes(tenant, used);
        Ok(used)
    }

    pub fn quota_bytes(&self, tenant: &TenantId) -> u64 {
        self.config.quota_bytes(tenant)
    }

    /// `quota - used`. Negative while the tenant is over quota.
    pub async fn available_bytes(&self, tenant: &TenantId) -> Result<i64> {
        let used = self.used_bytes(tenant).await?;
        Ok(signed(self.quota_bytes(tenant)) - signed(used))
    }

    /// Where the retrieval pipeline must materialize a file.
    pub fn file_path(&self, tenant: &TenantId, checksum: &str) -> Result<PathBuf> {
        self.filesystem.path_for(tenant, checksum)
    }

    /// `file://` URL of [`file_path`](Self::file_path).
    pub fn file_url(&self, tenant: &TenantId, checksum: &str) -> Result<Url> {
        let path = self.file_path(tenant, checksum)?;
        Url::from_file_path(&path)
            .map_err(|_| Error::Internal(format!("{} is not an absolute path", path.display())))
    }

    /// The cache reported as a storage location.
    pub async fn stats(&self, tenant: &TenantId) -> Result<CacheLocationStats> {
        let total_files = self.index.count(tenant).await?;
        let used = self.used_bytes(tenant).await?;
        let quota = self.quota_bytes(tenant);
        Ok(CacheLocationStats {
            name: CACHE_NAME.to_string(),
            total_files,
            used_kb: used / 1024,
            quota_kb: quota / 1024,
            available_bytes: signed(quota) - signed(used),
        })
    }

    async fn notify(&self, event: DomainEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!("Failed to publish cache event: {}", e);
        }
    }
}

impl std::fmt::Debug for CacheAdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAdmissionService")
            .field("cache_root", &self.filesystem.mapper().cache_root())
            .finish()
    }
}

fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCacheIndex, InMemoryEventCollector};
    use crate::cache::path_mapper::ContentAddressedPathMapper;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use proptest::prelude::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        index: Arc<InMemoryCacheIndex>,
        events: Arc<InMemoryEventCollector>,
        service: CacheAdmissionService,
        tenant: TenantId,
    }

    async fn fixture(quota_kb: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::with_root(dir.path());
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
        let service = CacheAdmissionService::new(
            index.clone(),
            filesystem,
            events.clone(),
            config,
            Arc::new(CacheMetrics::new()),
        );
        Fixture {
            _dir: dir,
            index,
            events,
            service,
            tenant,
        }
    }

    fn location(name: &str) -> Url {
        Url::parse(&format!("file:///cache/{}", name)).unwrap()
    }

    #[tokio::test]
    async fn test_add_file_creates_record() {
        let f = fixture(1024).await;
        let expiration = Utc::now() + Duration::hours(1);

        let record = f
            .service
            .add_file(
                &f.tenant,
                NewCachedFile::new("abc123", 1024, location("loc1"), expiration)
                    .with_file_name("file.dat")
                    .with_group_id("req-1"),
            )
            .await
            .unwrap();

        assert_eq!(record.generation, 1);
        assert_eq!(record.file_name.as_deref(), Some("file.dat"));
        assert!(record.group_ids.contains("req-1"));
        assert_eq!(f.events.events_of_type("CacheFileAdded").len(), 1);
    }

    #[tokio::test]
    async fn test_same_checksum_converges() {
        let f = fixture(1024).await;
        let t = Utc::now();

        f.service
            .add_file(
                &f.tenant,
                NewCachedFile::new("abc123", 1024, location("loc1"), t + Duration::hours(1)),
            )
            .await
            .unwrap();
        let record = f
            .service
            .add_file(
                &f.tenant,
                NewCachedFile::new("abc123", 2048, location("loc2"), t + Duration::minutes(30)),
            )
            .await
            .unwrap();

        assert_eq!(record.size_bytes, 2048);
        assert_eq!(record.expiration_date, t + Duration::hours(1));
        assert_eq!(record.location, Some(location("loc1")));
        assert_eq!(f.index.snapshot(&f.tenant).len(), 1);
    }

    #[tokio::test]
    async fn test_readd_with_same_expiration_refreshes_size() {
        let f = fixture(1024).await;
        let expiration = Utc::now() + Duration::hours(1);

        for size in [10, 20] {
            f.service
                .add_file(
                    &f.tenant,
                    NewCachedFile::new("abc123", size, location("loc1"), expiration),
                )
                .await
                .unwrap();
        }

        let record = f.service.search(&f.tenant, "abc123").await.unwrap().unwrap();
        assert_eq!(record.size_bytes, 20);
        assert_eq!(record.expiration_date, expiration);
    }

    #[tokio::test]
    async fn test_add_file_requires_initialized_partition() {
        let f = fixture(1024).await;
        let other = TenantId::new("unknown");

        let result = f
            .service
            .add_file(
                &other,
                NewCachedFile::new("abc123", 1, location("loc1"), Utc::now()),
            )
            .await;

        assert_matches!(result, Err(Error::TenantNotInitialized(_)));
        assert!(f.index.snapshot(&other).is_empty());
    }

    #[tokio::test]
    async fn test_add_file_rejects_bad_checksum() {
        let f = fixture(1024).await;

        let result = f
            .service
            .add_file(
                &f.tenant,
                NewCachedFile::new("../escape", 1, location("loc1"), Utc::now()),
            )
            .await;

        assert_matches!(result, Err(Error::InvalidChecksum { .. }));
    }

    #[tokio::test]
    async fn test_get_availables_single_hit() {
        let f = fixture(1024).await;
        f.service
            .add_file(
                &f.tenant,
                NewCachedFile::new("c2", 1, location("c2"), Utc::now() + Duration::hours(1)),
            )
            .await
            .unwrap();

        let candidates: HashSet<FileReference> = ["c1", "c2", "c3"]
            .into_iter()
            .map(|c| FileReference::new(c, format!("{}.dat", c), 1))
            .collect();
        let available = f.service.get_availables(&f.tenant, &candidates).await.unwrap();

        assert_eq!(available.len(), 1);
        assert!(available.iter().all(|r| r.checksum == "c2"));
        assert!(f
            .service
            .get_available(&f.tenant, &FileReference::new("c1", "c1.dat", 1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_register_availables_tags_group() {
        let f = fixture(1024).await;
        f.service
            .add_file(
                &f.tenant,
                NewCachedFile::new("c2", 1, location("c2"), Utc::now() + Duration::hours(1)),
            )
            .await
            .unwrap();

        let candidates: HashSet<FileReference> = [
            FileReference::new("c1", "a", 1),
            FileReference::new("c2", "b", 1),
        ]
        .into_iter()
        .collect();
        let available = f
            .service
            .register_availables(&f.tenant, &candidates, "group-7")
            .await
            .unwrap();

        assert_eq!(available.len(), 1);
        let record = f.service.search(&f.tenant, "c2").await.unwrap().unwrap();
        assert!(record.group_ids.contains("group-7"));
    }

    #[tokio::test]
    async fn test_quota_arithmetic_can_go_negative() {
        let f = fixture(1).await;
        let expiration = Utc::now() + Duration::hours(1);

        assert_eq!(f.service.available_bytes(&f.tenant).await.unwrap(), 1024);

        f.service
            .add_file(&f.tenant, NewCachedFile::new("a1", 1000, location("a1"), expiration))
            .await
            .unwrap();
        f.service
            .add_file(&f.tenant, NewCachedFile::new("b2", 100, location("b2"), expiration))
            .await
            .unwrap();

        let used = f.service.used_bytes(&f.tenant).await.unwrap();
        assert_eq!(used, 1100);
        assert_eq!(f.service.available_bytes(&f.tenant).await.unwrap(), -76);

        let stats = f.service.stats(&f.tenant).await.unwrap();
        assert_eq!(stats.name, "internal-cache");
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.quota_kb, 1);
        assert_eq!(stats.available_bytes, -76);
    }

    #[tokio::test]
    async fn test_file_url_points_to_mapped_path() {
        let f = fixture(1).await;

        let path = f.service.file_path(&f.tenant, "abcdef").unwrap();
        let url = f.service.file_url(&f.tenant, "abcdef").unwrap();

        assert!(path.ends_with("tenantX/ab/cd/ef/abcdef"));
        assert_eq!(url.to_file_path().unwrap(), path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_expiration_is_max_of_all_admissions(
            offsets in proptest::collection::vec(-1000i64..1000, 1..12)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let f = fixture(1024).await;
                let base = Utc::now();

                for (i, offset) in offsets.iter().enumerate() {
                    f.service
                        .add_file(
                            &f.tenant,
                            NewCachedFile::new(
                                "abc123",
                                i as u64,
                                location("loc"),
                                base + Duration::seconds(*offset),
                            ),
                        )
                        .await
                        .unwrap();
                }

                let record = f.service.search(&f.tenant, "abc123").await.unwrap().unwrap();
                let max = offsets.iter().max().copied().unwrap();
                assert_eq!(record.expiration_date, base + Duration::seconds(max));
                assert_eq!(record.size_bytes, offsets.len() as u64 - 1);
            });
        }
    }
}
