//! Content-Addressed Path Mapper
//!
//! Maps a checksum to its location in a tenant partition by folding the
//! checksum into 2-character directories:
//!
//! ```text
//! <cache_root>/<tenant>/ab/cd/ef/12/34/56/abcdef123456789...
//! ```
//!
//! The fold stops at `max_depth` levels or when fewer than two characters are
//! left, which keeps per-directory fan-out at 36^2 entries at most.

use std::path::{Path, PathBuf};

use crate::domain::ports::TenantId;
use crate::error::{Error, Result};

/// Characters per directory level
pub const SEGMENT_WIDTH: usize = 2;

/// Pure mapping from (tenant, checksum) to a path under the cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentAddressedPathMapper {
    cache_root: PathBuf,
    max_depth: usize,
}

impl ContentAddressedPathMapper {
    /// Create a mapper. A relative root is resolved against the working directory.
    pub fn new(cache_root: impl Into<PathBuf>, max_depth: usize) -> Self {
        let cache_root = cache_root.into();
        let cache_root = if cache_root.is_absolute() {
            cache_root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&cache_root))
                .unwrap_or(cache_root)
        };
        Self {
            cache_root,
            max_depth,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Root directory of a tenant partition.
    pub fn tenant_root(&self, tenant: &TenantId) -> Result<PathBuf> {
        validate_tenant(tenant)?;
        Ok(self.cache_root.join(tenant.as_str()))
    }

    /// Directory that holds the file of a checksum.
    pub fn directory_for(&self, tenant: &TenantId, checksum: &str) -> Result<PathBuf> {
        validate_checksum(checksum)?;
        let mut dir = self.tenant_root(tenant)?;
        for segment in segments(checksum, self.max_depth) {
            dir.push(segment);
        }
        Ok(dir)
    }

    /// Full path of the cached file of a checksum.
    pub fn path_for(&self, tenant: &TenantId, checksum: &str) -> Result<PathBuf> {
        Ok(self.directory_for(tenant, checksum)?.join(checksum))
    }
}

/// Directory segments of a checksum.
fn segments(checksum: &str, max_depth: usize) -> impl Iterator<Item = &str> {
    (0..max_depth)
        .map(|level| level * SEGMENT_WIDTH)
        .take_while(move |start| start + SEGMENT_WIDTH <= checksum.len())
        .map(move |start| &checksum[start..start + SEGMENT_WIDTH])
}

/// Reject checksums that cannot be used as a file name inside the partition.
pub fn validate_checksum(checksum: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::InvalidChecksum {
            checksum: checksum.to_string(),
            reason: reason.to_string(),
        })
    };

    if checksum.is_empty() {
        return invalid("checksum is empty");
    }
    if !checksum
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return invalid("only ASCII letters, digits, '-' and '_' are allowed");
    }
    Ok(())
}

/// Reject tenants that cannot be used as a partition directory name.
pub fn validate_tenant(tenant: &TenantId) -> Result<()> {
    let name = tenant.as_str();
    let invalid = |reason: &str| {
        Err(Error::InvalidTenant {
            tenant: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return invalid("tenant is empty");
    }
    if name.starts_with('.') {
        return invalid("tenant must not start with '.'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("only ASCII letters, digits, '-', '_' and '.' are allowed");
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
