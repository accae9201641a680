//! Size-Driven Eviction Policies
//!
//! Expiration is the primary eviction trigger. When a tenant is over quota
//! the scheduler can additionally ask a [`VictimSelector`] which unexpired
//! records to give up. Disabled unless `size_eviction_enabled` is set.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::ports::{CacheIndex, CachedFileRecord, PageRequest, TenantId};
use crate::error::Result;

/// Chooses records to evict to free a number of bytes.
#[async_trait]
pub trait VictimSelector: Send + Sync {
    /// Name of the policy, for logs
    fn name(&self) -> &'static str;

    /// Records whose sizes add up to at least `bytes_to_free`, or every
    /// record of the tenant when that is not enough.
    async fn select_victims(
        &self,
        tenant: &TenantId,
        bytes_to_free: u64,
    ) -> Result<Vec<CachedFileRecord>>;
}

/// Evicts the records closest to expiring first.
pub struct OldestExpirationFirst {
    index: Arc<dyn CacheIndex>,
    page_size: usize,
}

impl OldestExpirationFirst {
    pub fn new(index: Arc<dyn CacheIndex>, page_size: usize) -> Self {
        Self {
            index,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl VictimSelector for OldestExpirationFirst {
    fn name(&self) -> &'static str {
        "oldest-expiration-first"
    }

    async fn select_victims(
        &self,
        tenant: &TenantId,
        bytes_to_free: u64,
    ) -> Result<Vec<CachedFileRecord>> {
        if bytes_to_free == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        let mut page = Some(PageRequest::first(self.page_size));
        while let Some(request) = page {
            let result = self.index.find_all(tenant, &request).await?;
            candidates.extend(result.items);
            page = result.next;
        }

        candidates.sort_by(|a, b| {
            a.expiration_date
                .cmp(&b.expiration_date)
                .then_with(|| a.checksum.cmp(&b.checksum))
        });

        let mut freed = 0u64;
        let victims = candidates
            .into_iter()
            .take_while(|record| {
                let needed = freed < bytes_to_free;
                freed = freed.saturating_add(record.size_bytes);
                needed
            })
            .collect();
        Ok(victims)
    }
}

impl std::fmt::Debug for OldestExpirationFirst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OldestExpirationFirst")
            .field("page_size", &self.page_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
