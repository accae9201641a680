//! In-Memory Cache Index Adapter
//!
//! Implements the `CacheIndex` port over per-tenant ordered maps.
//!
//! Each tenant partition is a `BTreeMap` keyed by checksum behind its own
//! lock, so keyset paging is a range scan and every mutation of a record is
//! atomic with respect to concurrent writers of the same tenant.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::ports::{
    CacheIndex, CachedFileRecord, Page, PageRequest, TenantId, UpsertOutcome,
};
use crate::error::Result;

type Partition = Arc<RwLock<BTreeMap<String, CachedFileRecord>>>;

/// In-memory cache index.
///
/// Uses DashMap to shard tenants so that partitions never contend with each other.
#[derive(Debug, Default)]
pub struct InMemoryCacheIndex {
    partitions: DashMap<TenantId, Partition>,
}

impl InMemoryCacheIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, tenant: &TenantId) -> Partition {
        self.partitions
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone()
    }

    fn existing_partition(&self, tenant: &TenantId) -> Option<Partition> {
        self.partitions.get(tenant).map(|p| p.clone())
    }

    /// Replace the whole content of a tenant partition.
    pub fn load(&self, tenant: &TenantId, records: Vec<CachedFileRecord>) {
        let map = records
            .into_iter()
            .map(|record| (record.checksum.clone(), record))
            .collect();
        self.partitions
            .insert(tenant.clone(), Arc::new(RwLock::new(map)));
    }

    /// Store a record as is, without generation check.
    pub(crate) fn put(&self, tenant: &TenantId, record: CachedFileRecord) {
        self.partition(tenant)
            .write()
            .insert(record.checksum.clone(), record);
    }

    /// Drop a record without generation check.
    pub(crate) fn remove(&self, tenant: &TenantId, checksum: &str) {
        if let Some(partition) = self.existing_partition(tenant) {
            partition.write().remove(checksum);
        }
    }

    pub(crate) fn record_count(&self, tenant: &TenantId) -> usize {
        self.existing_partition(tenant)
            .map(|p| p.read().len())
            .unwrap_or(0)
    }

    /// Copy of every record of a tenant, ordered by checksum.
    pub fn snapshot(&self, tenant: &TenantId) -> Vec<CachedFileRecord> {
        self.existing_partition(tenant)
            .map(|p| p.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tenants with a partition in the index.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.partitions.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        tenants
    }

    fn page_where<F>(
        &self,
        tenant: &TenantId,
        page: &PageRequest,
        filter: F,
    ) -> Page<CachedFileRecord>
    where
        F: Fn(&CachedFileRecord) -> bool,
    {
        let Some(partition) = self.existing_partition(tenant) else {
            return Page::empty();
        };
        let map = partition.read();
        let lower = match &page.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };
        let items: Vec<CachedFileRecord> = map
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| filter(*record))
            .take(page.limit().saturating_add(1))
            .cloned()
            .collect();
        Page::from_sorted(items, page)
    }
}

#[async_trait]
impl CacheIndex for InMemoryCacheIndex {
    async fn find_by_checksum(
        &self,
        tenant: &TenantId,
        checksum: &str,
    ) -> Result<Option<CachedFileRecord>> {
        Ok(self
            .existing_partition(tenant)
            .and_then(|p| p.read().get(checksum).cloned()))
    }

    async fn find_all_by_checksums(
        &self,
        tenant: &TenantId,
        checksums: &HashSet<String>,
    ) -> Result<Vec<CachedFileRecord>> {
        let Some(partition) = self.existing_partition(tenant) else {
            return Ok(Vec::new());
        };
        let map = partition.read();
        Ok(checksums
            .iter()
            .filter_map(|checksum| map.get(checksum).cloned())
            .collect())
    }

    async fn upsert(&self, tenant: &TenantId, mut record: CachedFileRecord) -> Result<UpsertOutcome> {
        let partition = self.partition(tenant);
        let mut map = partition.write();

        let stored_generation = map.get(&record.checksum).map(|r| r.generation).unwrap_or(0);
        if stored_generation != record.generation {
            return Ok(UpsertOutcome::Conflict);
        }

        record.generation = stored_generation + 1;
        map.insert(record.checksum.clone(), record.clone());
        Ok(UpsertOutcome::Stored(record))
    }

    async fn find_expired_before(
        &self,
        tenant: &TenantId,
        instant: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Page<CachedFileRecord>> {
        Ok(self.page_where(tenant, page, |record| record.expiration_date < instant))
    }

    async fn find_all(
        &self,
        tenant: &TenantId,
        page: &PageRequest,
    ) -> Result<Page<CachedFileRecord>> {
        Ok(self.page_where(tenant, page, |_| true))
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        checksum: &str,
        expected_generation: u64,
    ) -> Result<bool> {
        let Some(partition) = self.existing_partition(tenant) else {
            return Ok(false);
        };
        let mut map = partition.write();
        match map.get(checksum) {
            Some(record) if record.generation == expected_generation => {
                map.remove(checksum);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn total_size_bytes(&self, tenant: &TenantId) -> Result<u64> {
        Ok(self
            .existing_partition(tenant)
            .map(|p| p.read().values().map(|r| r.size_bytes).sum())
            .unwrap_or(0))
    }

    async fn count(&self, tenant: &TenantId) -> Result<u64> {
        Ok(self
            .existing_partition(tenant)
            .map(|p| p.read().len() as u64)
            .unwrap_or(0))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tenant() -> TenantId {
        TenantId::new("project1")
    }

    fn record(checksum: &str, size: u64, expiration: DateTime<Utc>) -> CachedFileRecord {
        CachedFileRecord::new(checksum, size, None, expiration)
    }

    async fn store(index: &InMemoryCacheIndex, rec: CachedFileRecord) -> CachedFileRecord {
        match index.upsert(&tenant(), rec).await.unwrap() {
            UpsertOutcome::Stored(stored) => stored,
            UpsertOutcome::Conflict => panic!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let index = InMemoryCacheIndex::new();
        let stored = store(&index, record("abc", 10, Utc::now())).await;
        assert_eq!(stored.generation, 1);

        let found = index.find_by_checksum(&tenant(), "abc").await.unwrap();
        assert_eq!(found, Some(stored));
        assert!(index
            .find_by_checksum(&TenantId::new("other"), "abc")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_upsert_rejects_stale_generation() {
        let index = InMemoryCacheIndex::new();
        let stored = store(&index, record("abc", 10, Utc::now())).await;

        // A second writer that also believed the record was new
        let outcome = index.upsert(&tenant(), record("abc", 20, Utc::now())).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Conflict);

        let mut update = stored.clone();
        update.size_bytes = 30;
        let updated = store(&index, update).await;
        assert_eq!(updated.generation, 2);

        // The first stored copy is now stale
        let outcome = index.upsert(&tenant(), stored).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_find_all_by_checksums() {
        let index = InMemoryCacheIndex::new();
        store(&index, record("c2", 10, Utc::now())).await;

        let checksums: HashSet<String> = ["c1", "c2", "c3"].iter().map(|s| s.to_string()).collect();
        let found = index.find_all_by_checksums(&tenant(), &checksums).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].checksum, "c2");
    }

    #[tokio::test]
    async fn test_keyset_paging() {
        let index = InMemoryCacheIndex::new();
        for checksum in ["e", "a", "d", "b", "c"] {
            store(&index, record(checksum, 1, Utc::now())).await;
        }

        let mut seen = Vec::new();
        let mut request = Some(PageRequest::first(2));
        while let Some(page_request) = request {
            let page = index.find_all(&tenant(), &page_request).await.unwrap();
            seen.extend(page.items.iter().map(|r| r.checksum.clone()));
            request = page.next;
        }

        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_zero_sized_page_request_visits_every_record() {
        let index = InMemoryCacheIndex::new();
        for checksum in ["a", "b", "c"] {
            store(&index, record(checksum, 1, Utc::now())).await;
        }

        let mut seen = Vec::new();
        let mut request = Some(PageRequest {
            after: None,
            size: 0,
        });
        while let Some(page_request) = request {
            let page = index.find_all(&tenant(), &page_request).await.unwrap();
            seen.extend(page.items.iter().map(|r| r.checksum.clone()));
            request = page.next;
        }

        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_find_expired_before() {
        let index = InMemoryCacheIndex::new();
        let now = Utc::now();
        store(&index, record("old", 1, now - Duration::hours(1))).await;
        store(&index, record("new", 1, now + Duration::hours(1))).await;

        let page = index
            .find_expired_before(&tenant(), now, &PageRequest::first(10))
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].checksum, "old");
        assert!(!page.has_next());
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let index = InMemoryCacheIndex::new();
        let stored = store(&index, record("abc", 1, Utc::now())).await;

        assert!(!index.delete(&tenant(), "abc", stored.generation + 1).await.unwrap());
        assert!(index.delete(&tenant(), "abc", stored.generation).await.unwrap());
        assert!(!index.delete(&tenant(), "abc", stored.generation).await.unwrap());
        assert_eq!(index.count(&tenant()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_totals() {
        let index = InMemoryCacheIndex::new();
        store(&index, record("a", 100, Utc::now())).await;
        store(&index, record("b", 24, Utc::now())).await;

        assert_eq!(index.total_size_bytes(&tenant()).await.unwrap(), 124);
        assert_eq!(index.count(&tenant()).await.unwrap(), 2);
        assert_eq!(index.total_size_bytes(&TenantId::new("empty")).await.unwrap(), 0);
    }
}
