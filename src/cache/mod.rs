//! Nearline Cache Services
//!
//! Per-tenant, content-addressed disk cache in front of nearline storage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CacheScheduler                          │
//! │                  (fixed-rate, per tenant)                     │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────┐  ┌────────▼─────────┐  ┌──────────────────┐
//! │ CacheAdmission   │  │ EvictionService  │  │ Reconciliation   │
//! │ add/search/quota │  │ expired + quota  │  │ index <-> disk   │
//! └────────┬─────────┘  └────────┬─────────┘  └────────┬─────────┘
//!          │                     │                     │
//! ┌────────▼─────────────────────▼─────────────────────▼─────────┐
//! │      CacheIndex (port)   │   TenantCacheFilesystem            │
//! │                          │   ContentAddressedPathMapper       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The index is the source of truth. Admission never touches the disk;
//! eviction deletes a file before its entry; reconciliation removes entries
//! without files and reports files without entries.

pub mod admission;
pub mod eviction;
pub mod filesystem;
pub mod metrics;
pub mod path_mapper;
pub mod policy;
pub mod reconciliation;
pub mod scheduler;

use std::sync::Arc;

pub use admission::{CacheAdmissionService, CacheLocationStats, NewCachedFile};
pub use eviction::{EvictionService, PurgeOutcome, PurgeReport};
pub use filesystem::{FileRemoval, TenantCacheFilesystem};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use path_mapper::ContentAddressedPathMapper;
pub use policy::{OldestExpirationFirst, VictimSelector};
pub use reconciliation::{CacheReconciliationService, ReconcileAllReport, ReconciliationReport};
pub use scheduler::{CacheScheduler, SchedulerTickReport};

use crate::config::CacheConfig;
use crate::domain::ports::{CacheIndex, EventPublisher, TenantResolver};
use crate::error::Result;

/// All cache services wired over shared collaborators.
#[derive(Debug, Clone)]
pub struct CacheServices {
    pub filesystem: Arc<TenantCacheFilesystem>,
    pub admission: Arc<CacheAdmissionService>,
    pub eviction: Arc<EvictionService>,
    pub reconciliation: Arc<CacheReconciliationService>,
    pub scheduler: Arc<CacheScheduler>,
    pub metrics: Arc<CacheMetrics>,
}

impl CacheServices {
    /// Validate the configuration and build every service.
    pub fn build(
        config: CacheConfig,
        index: Arc<dyn CacheIndex>,
        publisher: Arc<dyn EventPublisher>,
        resolver: Arc<dyn TenantResolver>,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let filesystem = Arc::new(TenantCacheFilesystem::new(ContentAddressedPathMapper::new(
            config.cache_root.clone(),
            config.path_depth,
        )));
        let admission = Arc::new(CacheAdmissionService::new(
            index.clone(),
            filesystem.clone(),
            publisher.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let eviction = Arc::new(EvictionService::new(
            index.clone(),
            filesystem.clone(),
            publisher.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let reconciliation = Arc::new(CacheReconciliationService::new(
            index,
            filesystem.clone(),
            publisher,
            resolver.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(CacheScheduler::new(eviction.clone(), resolver, config));

        Ok(Self {
            filesystem,
            admission,
            eviction,
            reconciliation,
            scheduler,
            metrics,
        })
    }
}
