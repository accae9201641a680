//! Domain Events
//!
//! Immutable records of things that happened to a cache partition. Most are
//! audit records; `UnindexedCacheFile` is the operator-facing warning raised
//! by reconciliation when a file sits in the cache tree without an index entry.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::unindexed_cache_file(&tenant, "/var/cache/t1/foo.bin");
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::ports::{CachedFileRecord, TenantId};

/// Severity of an operator notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationLevel::Info => write!(f, "INFO"),
            NotificationLevel::Warning => write!(f, "WARNING"),
            NotificationLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Domain event representing a significant occurrence in a cache partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Admission Events
    // =========================================================================
    /// A retrieval completed and was recorded in the index.
    CacheFileAdded {
        tenant: String,
        checksum: String,
        size_bytes: u64,
        expiration_date: DateTime<Utc>,
        created: bool,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Eviction Events
    // =========================================================================
    /// A cached file and its index entry were removed.
    CacheFilePurged {
        tenant: String,
        checksum: String,
        size_bytes: u64,
        expiration_date: DateTime<Utc>,
        file_existed: bool,
        timestamp: DateTime<Utc>,
    },

    /// A cached file could not be deleted; its index entry was kept.
    CachePurgeFailed {
        tenant: String,
        checksum: String,
        path: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Reconciliation Events
    // =========================================================================
    /// An index entry without a backing file was removed.
    DirtyIndexEntryRemoved {
        tenant: String,
        checksum: String,
        path: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A file is present in the cache tree without any index entry.
    UnindexedCacheFile {
        tenant: String,
        path: String,
        title: String,
        message: String,
        level: NotificationLevel,
        timestamp: DateTime<Utc>,
    },

    /// A reconciliation sweep finished.
    CacheReconciled {
        tenant: String,
        removed_entries: u64,
        unindexed_files: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::CacheFileAdded { timestamp, .. } => *timestamp,
            DomainEvent::CacheFilePurged { timestamp, .. } => *timestamp,
            DomainEvent::CachePurgeFailed { timestamp, .. } => *timestamp,
            DomainEvent::DirtyIndexEntryRemoved { timestamp, .. } => *timestamp,
            DomainEvent::UnindexedCacheFile { timestamp, .. } => *timestamp,
            DomainEvent::CacheReconciled { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::CacheFileAdded { .. } => "CacheFileAdded",
            DomainEvent::CacheFilePurged { .. } => "CacheFilePurged",
            DomainEvent::CachePurgeFailed { .. } => "CachePurgeFailed",
            DomainEvent::DirtyIndexEntryRemoved { .. } => "DirtyIndexEntryRemoved",
            DomainEvent::UnindexedCacheFile { .. } => "UnindexedCacheFile",
            DomainEvent::CacheReconciled { .. } => "CacheReconciled",
        }
    }

    /// Get the tenant the event belongs to.
    pub fn tenant(&self) -> &str {
        match self {
            DomainEvent::CacheFileAdded { tenant, .. }
            | DomainEvent::CacheFilePurged { tenant, .. }
            | DomainEvent::CachePurgeFailed { tenant, .. }
            | DomainEvent::DirtyIndexEntryRemoved { tenant, .. }
            | DomainEvent::UnindexedCacheFile { tenant, .. }
            | DomainEvent::CacheReconciled { tenant, .. } => tenant,
        }
    }

    /// Get the checksum if applicable.
    pub fn checksum(&self) -> Option<&str> {
        match self {
            DomainEvent::CacheFileAdded { checksum, .. } => Some(checksum),
            DomainEvent::CacheFilePurged { checksum, .. } => Some(checksum),
            DomainEvent::CachePurgeFailed { checksum, .. } => Some(checksum),
            DomainEvent::DirtyIndexEntryRemoved { checksum, .. } => Some(checksum),
            _ => None,
        }
    }

    /// Whether an operator must look at this event.
    pub fn is_operator_notification(&self) -> bool {
        matches!(self, DomainEvent::UnindexedCacheFile { .. })
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    /// Create a CacheFileAdded event.
    pub fn cache_file_added(tenant: &TenantId, record: &CachedFileRecord, created: bool) -> Self {
        DomainEvent::CacheFileAdded {
            tenant: tenant.to_string(),
            checksum: record.checksum.clone(),
            size_bytes: record.size_bytes,
            expiration_date: record.expiration_date,
            created,
            timestamp: Utc::now(),
        }
    }

    /// Create a CacheFilePurged event.
    pub fn cache_file_purged(
        tenant: &TenantId,
        record: &CachedFileRecord,
        file_existed: bool,
    ) -> Self {
        DomainEvent::CacheFilePurged {
            tenant: tenant.to_string(),
            checksum: record.checksum.clone(),
            size_bytes: record.size_bytes,
            expiration_date: record.expiration_date,
            file_existed,
            timestamp: Utc::now(),
        }
    }

    /// Create a CachePurgeFailed event.
    pub fn cache_purge_failed(
        tenant: &TenantId,
        record: &CachedFileRecord,
        path: &Path,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::CachePurgeFailed {
            tenant: tenant.to_string(),
            checksum: record.checksum.clone(),
            path: path.display().to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a DirtyIndexEntryRemoved event.
    pub fn dirty_index_entry_removed(tenant: &TenantId, record: &CachedFileRecord) -> Self {
        DomainEvent::DirtyIndexEntryRemoved {
            tenant: tenant.to_string(),
            checksum: record.checksum.clone(),
            path: record.local_path().map(|p| p.display().to_string()),
            timestamp: Utc::now(),
        }
    }

    /// Create the operator warning for a file missing from the index.
    pub fn unindexed_cache_file(tenant: &TenantId, path: &Path) -> Self {
        DomainEvent::UnindexedCacheFile {
            tenant: tenant.to_string(),
            path: path.display().to_string(),
            title: "Dirty cache".to_string(),
            message: format!(
                "File {} is present in cache directory while it shouldn't be. \
                 Please remove this file from the cache directory",
                path.display()
            ),
            level: NotificationLevel::Warning,
            timestamp: Utc::now(),
        }
    }

    /// Create a CacheReconciled event.
    pub fn cache_reconciled(
        tenant: &TenantId,
        removed_entries: u64,
        unindexed_files: u64,
        duration: Duration,
    ) -> Self {
        DomainEvent::CacheReconciled {
            tenant: tenant.to_string(),
            removed_entries,
            unindexed_files,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
