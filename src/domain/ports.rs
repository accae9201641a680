//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the core abstractions (ports) that the cache services
//! depend on. Infrastructure adapters implement these traits to provide
//! concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │   CacheIndex │ TenantResolver │ EventPublisher      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ InMemoryCacheIndex │ JsonFileCacheIndex │ Logging... │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Tenant identifier (value object).
///
/// Every cache operation is scoped by an explicit tenant; there is no ambient
/// "current tenant".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A file known to the storage catalog, identified in the cache by its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileReference {
    pub checksum: String,
    pub file_name: String,
    pub size_bytes: u64,
}

impl FileReference {
    pub fn new(checksum: impl Into<String>, file_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            checksum: checksum.into(),
            file_name: file_name.into(),
            size_bytes,
        }
    }
}

/// Persisted cache entry, one per checksum per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFileRecord {
    /// Content identity, unique within a tenant partition
    pub checksum: String,
    /// Size of the cached copy
    pub size_bytes: u64,
    /// Where the cached copy lives (normally a `file://` URL)
    pub location: Option<Url>,
    /// Purge-eligible once now is past this instant
    pub expiration_date: DateTime<Utc>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_type: Option<String>,
    /// Availability requests referencing this file
    #[serde(default)]
    pub group_ids: BTreeSet<String>,
    /// Optimistic concurrency token, 0 until first stored
    #[serde(default)]
    pub generation: u64,
}

impl CachedFileRecord {
    /// Create a record that has never been stored.
    pub fn new(
        checksum: impl Into<String>,
        size_bytes: u64,
        location: Option<Url>,
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
            group_ids: BTreeSet::new(),
            generation: 0,
        }
    }

    /// Check whether the record can be purged at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration_date
    }

    /// Local filesystem path of the cached copy, if the location is a file URL.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.location
            .as_ref()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
    }

    /// Whether the location points somewhere other than the local filesystem.
    pub fn is_remote(&self) -> bool {
        matches!(&self.location, Some(url) if url.scheme() != "file")
    }
}

/// Keyset page request over records ordered by checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Return records with a checksum strictly greater than this one
    pub after: Option<String>,
    /// Maximum number of records per page
    pub size: usize,
}

impl PageRequest {
    /// First page; a zero size is raised to one so paging always advances.
    pub fn first(size: usize) -> Self {
        Self {
            after: None,
            size: size.max(1),
        }
    }

    /// Effective number of records per page
    pub fn limit(&self) -> usize {
        self.size.max(1)
    }
}

/// One page of records.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageRequest>,
}

impl Page<CachedFileRecord> {
    /// Build a page from records already sorted by checksum and truncated to
    /// `request.limit() + 1` (the extra record only signals there is more).
    pub fn from_sorted(mut items: Vec<CachedFileRecord>, request: &PageRequest) -> Self {
        let limit = request.limit();
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next = if has_more {
            items.last().map(|last| PageRequest {
                after: Some(last.checksum.clone()),
                size: limit,
            })
        } else {
            None
        };
        Self { items, next }
    }
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next: None,
        }
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

/// Result of a compare-and-swap upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Record stored; carries the stored value with its new generation
    Stored(CachedFileRecord),
    /// Another writer changed the record first
    Conflict,
}

// =============================================================================
// Cache Index Port
// =============================================================================

/// Port for cache index persistence.
///
/// The index is the single source of truth for what should be in the cache.
/// Implementations must apply `upsert` and `delete` atomically per checksum.
#[async_trait]
pub trait CacheIndex: Send + Sync {
    /// Find the record for a checksum.
    async fn find_by_checksum(
        &self,
        tenant: &TenantId,
        checksum: &str,
    ) -> Result<Option<CachedFileRecord>>;

    /// Find all records matching any of the checksums, in a single query.
    async fn find_all_by_checksums(
        &self,
        tenant: &TenantId,
        checksums: &HashSet<String>,
    ) -> Result<Vec<CachedFileRecord>>;

    /// Store a record if its generation matches the stored one (0 for a new record).
    async fn upsert(&self, tenant: &TenantId, record: CachedFileRecord) -> Result<UpsertOutcome>;

    /// Page through records whose expiration date is strictly before `instant`.
    async fn find_expired_before(
        &self,
        tenant: &TenantId,
        instant: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Page<CachedFileRecord>>;

    /// Page through all records of a tenant.
    async fn find_all(&self, tenant: &TenantId, page: &PageRequest)
        -> Result<Page<CachedFileRecord>>;

    /// Delete a record if it still has the expected generation.
    ///
    /// A delete is visible as soon as it returns but may only become durable
    /// at the next `flush`. A lost delete leaves an entry whose file is gone,
    /// which reconciliation removes.
    async fn delete(&self, tenant: &TenantId, checksum: &str, expected_generation: u64)
        -> Result<bool>;

    /// Make every delete acknowledged so far durable.
    ///
    /// Batch callers invoke this once per page. Upserts are durable when
    /// acknowledged and need no flush.
    async fn flush(&self, _tenant: &TenantId) -> Result<()> {
        Ok(())
    }

    /// Sum of `size_bytes` over all records of a tenant.
    async fn total_size_bytes(&self, tenant: &TenantId) -> Result<u64>;

    /// Number of records of a tenant.
    async fn count(&self, tenant: &TenantId) -> Result<u64>;
}

// =============================================================================
// Tenant Resolver Port
// =============================================================================

/// Port supplying the tenants that currently own a cache partition.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// List all active tenants.
    async fn active_tenants(&self) -> Result<Vec<TenantId>>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

use super::events::DomainEvent;

/// Port for publishing domain events and operator notifications.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
