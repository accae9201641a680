//! Domain Layer
//!
//! Core types of the nearline cache, following Domain-Driven Design principles.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the index, tenant
//!   resolution and event publishing, plus the value objects they exchange
//! - **Events** (`events.rs`) - Domain events for audit and operator notification
//!
//! # Usage
//!
//! ```ignore
//! use nearline_cache::domain::{CacheIndex, TenantId};
//!
//! async fn is_cached<I: CacheIndex>(index: &I, tenant: &TenantId, checksum: &str) -> Result<bool> {
//!     Ok(index.find_by_checksum(tenant, checksum).await?.is_some())
//! }
//! ```

pub mod events;
pub mod ports;

// Re-export commonly used types
pub use events::{DomainEvent, NotificationLevel};
pub use ports::{
    // Port traits
    CacheIndex,
    EventPublisher,
    TenantResolver,
    // Value objects
    CachedFileRecord,
    FileReference,
    Page,
    PageRequest,
    TenantId,
    UpsertOutcome,
};
