//! Cache Metrics Collection
//!
//! In-process counters for the cache services, optionally mirrored into the
//! default Prometheus registry so the binary can serve them on `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGaugeVec};
use tracing::warn;

use crate::domain::ports::TenantId;

/// Prometheus collectors, registered once per process
struct PrometheusCacheMetrics {
    admissions: IntCounterVec,
    lookups: IntCounterVec,
    purged_files: IntCounterVec,
    purge_failures: IntCounterVec,
    dirty_entries_removed: IntCounterVec,
    unindexed_files: IntCounterVec,
    used_bytes: IntGaugeVec,
}

impl PrometheusCacheMetrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            admissions: prometheus::register_int_counter_vec!(
                "nearline_cache_admissions_total",
                "Files added to or refreshed in the cache",
                &["tenant"]
            )?,
            lookups: prometheus::register_int_counter_vec!(
                "nearline_cache_lookups_total",
                "Cache lookups by result",
                &["tenant", "result"]
            )?,
            purged_files: prometheus::register_int_counter_vec!(
                "nearline_cache_purged_files_total",
                "Cached files evicted",
                &["tenant"]
            )?,
            purge_failures: prometheus::register_int_counter_vec!(
                "nearline_cache_purge_failures_total",
                "Cached files that could not be deleted",
                &["tenant"]
            )?,
            dirty_entries_removed: prometheus::register_int_counter_vec!(
                "nearline_cache_dirty_entries_removed_total",
                "Index entries removed because their file was missing",
                &["tenant"]
            )?,
            unindexed_files: prometheus::register_int_counter_vec!(
                "nearline_cache_unindexed_files_total",
                "Files found in the cache directory without an index entry",
                &["tenant"]
            )?,
            used_bytes: prometheus::register_int_gauge_vec!(
                "nearline_cache_used_bytes",
                "Bytes accounted to the cache index",
                &["tenant"]
            )?,
        })
    }
}

static PROMETHEUS: Lazy<Option<PrometheusCacheMetrics>> =
    Lazy::new(|| match PrometheusCacheMetrics::register() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!("Unable to register cache metrics: {}", e);
            None
        }
    });

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    admissions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    purged_files: AtomicU64,
    purged_bytes: AtomicU64,
    purge_failures: AtomicU64,
    dirty_entries_removed: AtomicU64,
    unindexed_files: AtomicU64,
    exported: bool,
}

impl CacheMetrics {
    /// Create a collector that only counts in-process
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector that also updates the Prometheus registry
    pub fn exported() -> Self {
        Self {
            exported: true,
            ..Self::default()
        }
    }

    fn prometheus(&self) -> Option<&'static PrometheusCacheMetrics> {
        if self.exported {
            PROMETHEUS.as_ref()
        } else {
            None
        }
    }

    pub fn record_admission(&self, tenant: &TenantId) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = self.prometheus() {
            p.admissions.with_label_values(&[tenant.as_str()]).inc();
        }
    }

    pub fn record_hit(&self, tenant: &TenantId) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = self.prometheus() {
            p.lookups.with_label_values(&[tenant.as_str(), "hit"]).inc();
        }
    }

    pub fn record_miss(&self, tenant: &TenantId) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = self.prometheus() {
            p.lookups.with_label_values(&[tenant.as_str(), "miss"]).inc();
        }
    }

    pub fn record_purge(&self, tenant: &TenantId, size_bytes: u64) {
        self.purged_files.fetch_add(1, Ordering::Relaxed);
        self.purged_bytes.fetch_add(size_bytes, Ordering::Relaxed);
        if let Some(p) = self.prometheus() {
            p.purged_files.with_label_values(&[tenant.as_str()]).inc();
        }
    }

    pub fn record_purge_failure(&self, tenant: &TenantId) {
        self.purge_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = self.prometheus() {
            p.purge_failures.with_label_values(&[tenant.as_str()]).inc();
        }
    }

    pub fn record_dirty_entry_removed(&self, tenant: &TenantId) {
        self.dirty_entries_removed.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = self.prometheus() {
            p.dirty_entries_removed
                .with_label_values(&[tenant.as_str()])
                .inc();
        }
    }

    pub fn record_unindexed_file(&self, tenant: &TenantId) {
        self.unindexed_files.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = self.prometheus() {
            p.unindexed_files.with_label_values(&[tenant.as_str()]).inc();
        }
    }

    /// Publish the bytes currently accounted to a tenant
    pub fn update_used_bytes(&self, tenant: &TenantId, used_bytes: u64) {
        if let Some(p) = self.prometheus() {
            p.used_bytes
                .with_label_values(&[tenant.as_str()])
                .set(i64::try_from(used_bytes).unwrap_or(i64::MAX));
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admissions: self.admissions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            purged_files: self.purged_files.load(Ordering::Relaxed),
            purged_bytes: self.purged_bytes.load(Ordering::Relaxed),
            purge_failures: self.purge_failures.load(Ordering::Relaxed),
            dirty_entries_removed: self.dirty_entries_removed.load(Ordering::Relaxed),
            unindexed_files: self.unindexed_files.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the cache metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub admissions: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub purged_files: u64,
    pub purged_bytes: u64,
    pub purge_failures: u64,
    pub dirty_entries_removed: u64,
    pub unindexed_files: u64,
}

// =============================================================================
// Tests
// =============================================================================
