//! Nearline Cache - Tenant-Partitioned Disk Cache for Nearline Storage
//!
//! A size-bounded, TTL-evicting local disk cache that makes objects from slow
//! or archival backends temporarily available on fast storage, per tenant.
//!
//! # Architecture
//!
//! ```text
//! Retrieval pipeline → CacheAdmission → CacheIndex ← Eviction ← Scheduler
//!                                           ↑
//!                                    Reconciliation ↔ Tenant partitions
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Path mapping, partitions, admission, eviction, reconciliation
//! - [`config`] - Cache configuration
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`error`] - Error types

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheAdmissionService, CacheReconciliationService, CacheScheduler, CacheServices,
    ContentAddressedPathMapper, EvictionService, NewCachedFile, TenantCacheFilesystem,
};
pub use config::CacheConfig;
pub use domain::{CacheIndex, CachedFileRecord, FileReference, TenantId};
pub use error::{Error, Result};
