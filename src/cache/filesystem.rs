//! Tenant Cache Filesystem
//!
//! Lifecycle of the per-tenant partition directories: creation, permission
//! validation, walking and file removal. An unusable partition root is a
//! configuration error and is never retried silently.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::path_mapper::ContentAddressedPathMapper;
use crate::domain::ports::TenantId;
use crate::error::{Error, Result};

/// Chunks buffered between the directory walker and its consumer
const WALK_CHANNEL_CAPACITY: usize = 2;

/// Prefix of the transient file used to check a partition is writable
const WRITE_CHECK_PREFIX: &str = ".write-check-";

/// Outcome of a cached file removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRemoval {
    /// The file existed and was deleted
    Removed,
    /// The file was already gone
    Missing,
    /// The file is still there
    Failed(String),
}

/// Per-tenant cache partitions rooted under one cache root.
#[derive(Debug)]
pub struct TenantCacheFilesystem {
    mapper: ContentAddressedPathMapper,
    initialized: DashSet<TenantId>,
}

impl TenantCacheFilesystem {
    pub fn new(mapper: ContentAddressedPathMapper) -> Self {
        Self {
            mapper,
            initialized: DashSet::new(),
        }
    }

    pub fn mapper(&self) -> &ContentAddressedPathMapper {
        &self.mapper
    }

    /// Root directory of a tenant partition
    pub fn tenant_root(&self, tenant: &TenantId) -> Result<PathBuf> {
        self.mapper.tenant_root(tenant)
    }

    /// Path of the cached file of a checksum
    pub fn path_for(&self, tenant: &TenantId, checksum: &str) -> Result<PathBuf> {
        self.mapper.path_for(tenant, checksum)
    }

    /// Whether `ensure_initialized` succeeded for the tenant in this process
    pub fn is_initialized(&self, tenant: &TenantId) -> bool {
        self.initialized.contains(tenant)
    }

    /// Create the tenant partition if needed and check it is a readable,
    /// writable directory.
    pub async fn ensure_initialized(&self, tenant: &TenantId) -> Result<PathBuf> {
        let root = self.tenant_root(tenant)?;
        debug!(
            tenant = %tenant,
            "Initializing cache file system in {}",
            root.display()
        );

        match tokio::fs::metadata(&root).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&root).await.map_err(|e| {
                    Error::Config(format!(
                        "Error initializing cache directory {}: {}",
                        root.display(),
                        e
                    ))
                })?;
                info!(tenant = %tenant, "Created cache directory {}", root.display());
            }
            Err(e) => {
                return Err(invalid_root(&root, &e.to_string()));
            }
        }

        let metadata = tokio::fs::metadata(&root)
            .await
            .map_err(|e| invalid_root(&root, &e.to_string()))?;
        if !metadata.is_dir() {
            return Err(invalid_root(&root, "not a directory"));
        }

        tokio::fs::read_dir(&root)
            .await
            .map_err(|e| invalid_root(&root, &format!("not readable: {}", e)))?;

        let check_file = root.join(format!("{}{}", WRITE_CHECK_PREFIX, uuid::Uuid::new_v4()));
        tokio::fs::write(&check_file, b"")
            .await
            .map_err(|e| invalid_root(&root, &format!("not writable: {}", e)))?;
        if let Err(e) = tokio::fs::remove_file(&check_file).await {
            warn!("Unable to remove write check file {}: {}", check_file.display(), e);
        }

        self.initialized.insert(tenant.clone());
        Ok(root)
    }

    /// Walk every regular file of a tenant partition.
    ///
    /// The walk runs on the blocking pool and yields absolute paths in chunks
    /// of at most `chunk_size`, so memory stays bounded by the chunk size.
    /// Dot-prefixed entries (write checks, editor and sync leftovers) are
    /// never cached files and are skipped along with their subtrees.
    pub fn walk_files(
        &self,
        tenant: &TenantId,
        chunk_size: usize,
    ) -> Result<mpsc::Receiver<Result<Vec<PathBuf>>>> {
        let root = self.tenant_root(tenant)?;
        let chunk_size = chunk_size.max(1);
        let (tx, rx) = mpsc::channel(WALK_CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut chunk = Vec::with_capacity(chunk_size);
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let err = e
                            .into_io_error()
                            .map(Error::Io)
                            .unwrap_or_else(|| Error::Internal("cache walk failed".into()));
                        let _ = tx.blocking_send(Err(err));
                        return;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                chunk.push(entry.into_path());
                if chunk.len() >= chunk_size {
                    let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                    if tx.blocking_send(Ok(full)).is_err() {
                        return;
                    }
                }
            }
            if !chunk.is_empty() {
                let _ = tx.blocking_send(Ok(chunk));
            }
        });

        Ok(rx)
    }

    /// Collect every file of a tenant partition, sorted.
    pub async fn list_files(&self, tenant: &TenantId) -> Result<Vec<PathBuf>> {
        let mut rx = self.walk_files(tenant, 1024)?;
        let mut files = Vec::new();
        while let Some(chunk) = rx.recv().await {
            files.extend(chunk?);
        }
        files.sort();
        Ok(files)
    }

    /// Delete one cached file within `timeout`.
    pub async fn remove_file(&self, path: &Path, timeout: Duration) -> FileRemoval {
        match tokio::time::timeout(timeout, tokio::fs::remove_file(path)).await {
            Ok(Ok(())) => FileRemoval::Removed,
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => FileRemoval::Missing,
            Ok(Err(e)) => FileRemoval::Failed(e.to_string()),
            Err(_) => FileRemoval::Failed(format!("deletion timed out after {:?}", timeout)),
        }
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

fn invalid_root(root: &Path, reason: &str) -> Error {
    Error::Config(format!(
        "Error initializing cache directory. {} is not a valid directory: {}",
        root.display(),
        reason
    ))
}

// =============================================================================
// Tests
// =============================================================================
