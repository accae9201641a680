//! Cache Scheduler
//!
//! Fixed-rate trigger that runs eviction for every active tenant. Tenants of
//! one tick are purged concurrently up to `max_concurrent_tenants`; a failing
//! tenant is logged and never aborts the tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::eviction::{EvictionService, PurgeReport};
use crate::config::CacheConfig;
use crate::domain::ports::{TenantId, TenantResolver};
use crate::error::Result;

/// Summary of one scheduler tick
#[derive(Debug, Default)]
pub struct SchedulerTickReport {
    /// Tenants whose purge completed
    pub tenants: usize,
    /// Tenants whose purge failed
    pub failed: Vec<TenantId>,
    pub purge: PurgeReport,
    pub duration: Duration,
}

/// Periodic eviction driver
pub struct CacheScheduler {
    eviction: Arc<EvictionService>,
    resolver: Arc<dyn TenantResolver>,
    config: Arc<CacheConfig>,
}

impl CacheScheduler {
    pub fn new(
        eviction: Arc<EvictionService>,
        resolver: Arc<dyn TenantResolver>,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            eviction,
            resolver,
            config,
        }
    }

    /// Run until `shutdown` is cancelled, one tick per `purge_interval`.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting cache scheduler (interval={:?}, size eviction={})",
            self.config.purge_interval, self.config.size_eviction_enabled
        );

        let mut tick = interval(self.config.purge_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Cache scheduler shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Error running cache purge: {}", e);
                    }
                }
            }
        }
    }

    /// Purge every active tenant once.
    pub async fn run_once(&self) -> Result<SchedulerTickReport> {
        let start = Instant::now();
        let tenants = self.resolver.active_tenants().await?;
        debug!("Purging cache of {} tenants", tenants.len());

        let results: Vec<(TenantId, Result<PurgeReport>)> = stream::iter(tenants)
            .map(|tenant| async move {
                let result = self.purge_tenant(&tenant).await;
                (tenant, result)
            })
            .buffer_unordered(self.config.max_concurrent_tenants.max(1))
            .collect()
            .await;

        let mut report = SchedulerTickReport::default();
        for (tenant, result) in results {
            match result {
                Ok(purge) => {
                    report.tenants += 1;
                    report.purge.merge(&purge);
                }
                Err(e) => {
                    error!(tenant = %tenant, "Cache purge failed: {}", e);
                    report.failed.push(tenant);
                }
            }
        }
        report.duration = start.elapsed();
        Ok(report)
    }

    async fn purge_tenant(&self, tenant: &TenantId) -> Result<PurgeReport> {
        let mut report = self.eviction.purge_expired(tenant).await?;
        if self.config.size_eviction_enabled {
            let by_size = self.eviction.purge_to_quota(tenant).await?;
            report.merge(&by_size);
        }
        Ok(report)
    }
}

impl std::fmt::Debug for CacheScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheScheduler")
            .field("interval", &self.config.purge_interval)
            .field("max_concurrent_tenants", &self.config.max_concurrent_tenants)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
