//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │      CacheIndex │ TenantResolver │ EventPublisher          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryCacheIndex │ JsonFileCacheIndex                    │ │
//! │  │ StaticTenantResolver │ LoggingEventPublisher               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nearline_cache::adapters::JsonFileCacheIndex;
//! use nearline_cache::domain::CacheIndex;
//!
//! let index = JsonFileCacheIndex::open("/var/cache/nearline/.index").await?;
//! let record = index.find_by_checksum(&tenant, "abc123").await?;
//! ```

mod event_publisher;
mod in_memory_index;
mod json_file_index;
mod tenant_resolver;

pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use in_memory_index::InMemoryCacheIndex;
pub use json_file_index::JsonFileCacheIndex;
pub use tenant_resolver::StaticTenantResolver;
