//! Cache Configuration
//!
//! All inputs of the cache subsystem: cache root, index location, per-tenant
//! quotas, paging and scheduling knobs. Loadable from a YAML file; the binary
//! applies command-line overrides on top.
//!
//! ```yaml
//! cache_root: /var/cache/nearline
//! default_quota_kb: 500000000
//! tenant_quotas_kb:
//!   project1: 1048576
//! tenants: [project1, project2]
//! purge_interval: 5m
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ports::TenantId;
use crate::error::{Error, Result};

/// Name under which the cache reports itself as a storage location
pub const CACHE_NAME: &str = "internal-cache";

/// Default per-tenant quota (500 000 000 KiB)
pub const DEFAULT_QUOTA_KB: u64 = 500_000_000;

/// Default number of records handled per page
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default number of 2-character directory levels in the cache tree
pub const DEFAULT_PATH_DEPTH: usize = 6;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of all tenant partitions
    pub cache_root: PathBuf,

    /// Directory of the persisted index (defaults to `<cache_root>/.index`)
    pub index_dir: Option<PathBuf>,

    /// Quota applied to tenants without an explicit one, in KiB
    pub default_quota_kb: u64,

    /// Per-tenant quota overrides, in KiB
    pub tenant_quotas_kb: BTreeMap<String, u64>,

    /// Tenants served by this node
    pub tenants: Vec<String>,

    /// Records handled per page by eviction and reconciliation
    pub page_size: usize,

    /// Number of 2-character directory levels
    pub path_depth: usize,

    /// Interval between scheduled purges
    #[serde(with = "duration_str")]
    pub purge_interval: Duration,

    /// Upper bound on a single file deletion during eviction
    #[serde(with = "duration_str")]
    pub file_delete_timeout: Duration,

    /// Tenants purged in parallel by one scheduler tick
    pub max_concurrent_tenants: usize,

    /// Also evict unexpired files when a tenant is over quota
    pub size_eviction_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/cache/nearline"),
            index_dir: None,
            default_quota_kb: DEFAULT_QUOTA_KB,
            tenant_quotas_kb: BTreeMap::new(),
            tenants: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            path_depth: DEFAULT_PATH_DEPTH,
            purge_interval: Duration::from_secs(5 * 60),
            file_delete_timeout: Duration::from_secs(5),
            max_concurrent_tenants: 4,
            size_eviction_enabled: false,
        }
    }
}

impl CacheConfig {
    /// Config rooted at `cache_root` with every other value defaulted
    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Default::default()
        }
    }

    /// Load and validate a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Unable to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML configuration document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be greater than 0".into()));
        }
        if self.path_depth == 0 {
            return Err(Error::Config("path_depth must be greater than 0".into()));
        }
        if self.purge_interval.is_zero() {
            return Err(Error::Config("purge_interval must be greater than 0".into()));
        }
        if self.max_concurrent_tenants == 0 {
            return Err(Error::Config(
                "max_concurrent_tenants must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Directory of the persisted index
    pub fn index_dir(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| self.cache_root.join(".index"))
    }

    /// Quota of a tenant in bytes
    pub fn quota_bytes(&self, tenant: &TenantId) -> u64 {
        self.tenant_quotas_kb
            .get(tenant.as_str())
            .copied()
            .unwrap_or(self.default_quota_kb)
            .saturating_mul(1024)
    }

    /// Configured tenants as identifiers
    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.tenants.iter().map(|t| TenantId::new(t.as_str())).collect()
    }
}

/// Parse a duration string like "30s", "5m", "1h30m" or "1d".
///
/// A trailing bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
        } else {
            let num: u64 = num_buf
                .parse()
                .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
            num_buf.clear();

            let multiplier = match c {
                'd' | 'D' => 86400,
                'h' | 'H' => 3600,
                'm' | 'M' => 60,
                's' | 'S' => 1,
                _ => {
                    return Err(Error::DurationParse(format!(
                        "unknown duration unit: {}",
                        c
                    )))
                }
            };

            total_secs += num * multiplier;
        }
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs += num;
    }

    Ok(Duration::from_secs(total_secs))
}

/// Serde adapter storing durations as human-readable strings
mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();

        assert_eq!(config.page_size, 500);
        assert_eq!(config.path_depth, 6);
        assert_eq!(config.purge_interval, Duration::from_secs(300));
        assert_eq!(config.index_dir(), PathBuf::from("/var/cache/nearline/.index"));
        assert!(!config.size_eviction_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quota_bytes() {
        let mut config = CacheConfig::default();
        config.tenant_quotas_kb.insert("small".into(), 2);

        assert_eq!(config.quota_bytes(&TenantId::new("small")), 2048);
        assert_eq!(
            config.quota_bytes(&TenantId::new("other")),
            DEFAULT_QUOTA_KB * 1024
        );
    }

    #[test]
    fn test_from_yaml() {
        let config = CacheConfig::from_yaml(
            r#"
cache_root: /data/cache
tenants: [project1, project2]
tenant_quotas_kb:
  project1: 1024
purge_interval: 1h30m
file_delete_timeout: 10s
"#,
        )
        .unwrap();

        assert_eq!(config.cache_root, PathBuf::from("/data/cache"));
        assert_eq!(config.tenant_ids().len(), 2);
        assert_eq!(config.quota_bytes(&TenantId::new("project1")), 1024 * 1024);
        assert_eq!(config.purge_interval, Duration::from_secs(5400));
        assert_eq!(config.file_delete_timeout, Duration::from_secs(10));
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_from_yaml_rejects_zero_page_size() {
        let result = CacheConfig::from_yaml("page_size: 0\n");
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_from_yaml_rejects_bad_duration() {
        let result = CacheConfig::from_yaml("purge_interval: 5x\n");
        assert_matches!(result, Err(Error::ConfigParse(_)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("m"), Err(Error::DurationParse(_)));
    }
}
