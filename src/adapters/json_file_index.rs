//! JSON File Cache Index Adapter
//!
//! Durable `CacheIndex` that keeps an in-memory index as the query engine and
//! records mutations in a per-tenant append-only journal of JSON lines:
//!
//! ```text
//! <index_dir>/<tenant>.json      compacted snapshot (temp file + rename)
//! <index_dir>/<tenant>.journal   mutations since the snapshot
//! ```
//!
//! A mutation is journaled first and applied in memory only once the write
//! succeeded, so a failed write leaves the index unchanged. Upserts are
//! synced before they are acknowledged; deletes are synced by `flush`. The
//! journal is folded into the snapshot at `open` and whenever it outgrows
//! the live record count.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::in_memory_index::InMemoryCacheIndex;
use crate::domain::ports::{
    CacheIndex, CachedFileRecord, Page, PageRequest, TenantId, UpsertOutcome,
};
use crate::error::{Error, Result};

const SNAPSHOT_EXTENSION: &str = "json";
const JOURNAL_EXTENSION: &str = "journal";

/// Journal entries always tolerated before compaction
const MIN_COMPACTION_ENTRIES: u64 = 1024;

/// On-disk layout of one tenant snapshot
#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    tenant: TenantId,
    written_at: DateTime<Utc>,
    records: Vec<CachedFileRecord>,
}

/// One journal line
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Put { record: CachedFileRecord },
    Delete { checksum: String },
}

/// Write state of one tenant journal, guarded by the tenant write lock.
#[derive(Debug, Default)]
struct TenantJournal {
    file: Option<File>,
    /// Bytes known to hold complete entries
    len: u64,
    /// Entries written since the last compaction
    entries: u64,
    /// Written entries not yet synced
    unsynced: bool,
    /// A failed append may have left a partial line behind
    torn: bool,
}

/// File-backed cache index.
#[derive(Debug)]
pub struct JsonFileCacheIndex {
    /// Directory holding snapshots and journals
    directory: PathBuf,
    /// Query engine
    inner: InMemoryCacheIndex,
    /// Serializes writers per tenant
    journals: DashMap<TenantId, Arc<Mutex<TenantJournal>>>,
    journal_syncs: AtomicU64,
    snapshot_writes: AtomicU64,
}

impl JsonFileCacheIndex {
    /// Open the index directory, creating it if needed, load every tenant and
    /// fold pending journals into their snapshots.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await.map_err(|e| {
            Error::Config(format!(
                "Unable to create cache index directory {}: {}",
                directory.display(),
                e
            ))
        })?;

        let mut tenants: BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            let slot = tenants.entry(stem.to_string()).or_default();
            match path.extension().and_then(|e| e.to_str()) {
                Some(SNAPSHOT_EXTENSION) => slot.0 = Some(path),
                Some(JOURNAL_EXTENSION) => slot.1 = Some(path),
                _ => {}
            }
        }

        let index = Self {
            directory,
            inner: InMemoryCacheIndex::new(),
            journals: DashMap::new(),
            journal_syncs: AtomicU64::new(0),
            snapshot_writes: AtomicU64::new(0),
        };

        for (name, (snapshot, journal)) in tenants {
            if snapshot.is_none() && journal.is_none() {
                continue;
            }
            let tenant = TenantId::new(name);
            let mut records = BTreeMap::new();
            if let Some(path) = snapshot {
                let bytes = tokio::fs::read(&path).await?;
                let snapshot: IndexSnapshot = serde_json::from_slice(&bytes)?;
                records.extend(snapshot.records.into_iter().map(|r| (r.checksum.clone(), r)));
            }
            let replayed = match journal {
                Some(path) => replay_journal(&path, &mut records).await?,
                None => 0,
            };

            info!(
                tenant = %tenant,
                records = records.len(),
                replayed,
                "Loaded cache index"
            );
            index.inner.load(&tenant, records.into_values().collect());

            if replayed > 0 {
                let lock = index.journal(&tenant);
                let mut journal = lock.lock().await;
                index.compact(&tenant, &mut journal).await?;
            }
        }

        Ok(index)
    }

    /// Directory holding snapshots and journals
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Tenants present in the index
    pub fn tenants(&self) -> Vec<TenantId> {
        self.inner.tenants()
    }

    /// Journal syncs performed since open
    pub fn journal_syncs(&self) -> u64 {
        self.journal_syncs.load(Ordering::Relaxed)
    }

    /// Snapshots written since open, compaction at open included
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::Relaxed)
    }

    fn snapshot_path(&self, tenant: &TenantId) -> PathBuf {
        self.directory
            .join(format!("{}.{}", tenant.as_str(), SNAPSHOT_EXTENSION))
    }

    fn journal_path(&self, tenant: &TenantId) -> PathBuf {
        self.directory
            .join(format!("{}.{}", tenant.as_str(), JOURNAL_EXTENSION))
    }

    fn journal(&self, tenant: &TenantId) -> Arc<Mutex<TenantJournal>> {
        self.journals
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TenantJournal::default())))
            .clone()
    }

    /// Append one entry. On error nothing was recorded.
    async fn append(
        &self,
        tenant: &TenantId,
        journal: &mut TenantJournal,
        entry: &JournalEntry,
        sync: bool,
    ) -> Result<()> {
        if journal.torn {
            self.compact(tenant, journal).await?;
        }

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        match self.write_line(tenant, journal, &line, sync).await {
            Ok(()) => {
                journal.len += line.len() as u64;
                journal.entries += 1;
                Ok(())
            }
            Err(e) => {
                self.discard_partial_write(journal).await;
                Err(Error::Index(format!(
                    "Failed to journal cache index change for {}: {}",
                    tenant, e
                )))
            }
        }
    }

    async fn write_line(
        &self,
        tenant: &TenantId,
        journal: &mut TenantJournal,
        line: &[u8],
        sync: bool,
    ) -> Result<()> {
        if journal.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.journal_path(tenant))
                .await?;
            journal.len = file.metadata().await?.len();
            journal.file = Some(file);
        }
        let Some(file) = journal.file.as_mut() else {
            return Err(Error::Internal("cache index journal is not open".into()));
        };

        file.write_all(line).await?;
        if sync {
            file.sync_data().await?;
            self.journal_syncs.fetch_add(1, Ordering::Relaxed);
            journal.unsynced = false;
        } else {
            journal.unsynced = true;
        }
        Ok(())
    }

    /// Cut the journal back to its last complete entry, or mark it torn so
    /// the next writer compacts first.
    async fn discard_partial_write(&self, journal: &mut TenantJournal) {
        let restored = match journal.file.as_mut() {
            Some(file) => file.set_len(journal.len).await.is_ok(),
            None => true,
        };
        if !restored {
            journal.file = None;
            journal.torn = true;
        }
    }

    /// Write the in-memory state as the tenant snapshot and empty the journal.
    async fn compact(&self, tenant: &TenantId, journal: &mut TenantJournal) -> Result<()> {
        let snapshot = IndexSnapshot {
            tenant: tenant.clone(),
            written_at: Utc::now(),
            records: self.inner.snapshot(tenant),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        let target = self.snapshot_path(tenant);
        let tmp = self
            .directory
            .join(format!(".{}.{}.tmp", tenant.as_str(), uuid::Uuid::new_v4()));
        {
            let mut file = File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Index(format!(
                "Failed to write cache index snapshot {}: {}",
                target.display(),
                e
            )));
        }
        self.snapshot_writes.fetch_add(1, Ordering::Relaxed);

        // Snapshot first: replaying a stale journal over it is harmless
        let emptied = File::create(self.journal_path(tenant)).await?;
        emptied.sync_all().await?;
        *journal = TenantJournal::default();

        debug!(
            tenant = %tenant,
            records = snapshot.records.len(),
            "Cache index compacted"
        );
        Ok(())
    }

    async fn compact_if_grown(&self, tenant: &TenantId, journal: &mut TenantJournal) {
        let live = self.inner.record_count(tenant) as u64;
        if journal.entries <= live.max(MIN_COMPACTION_ENTRIES) {
            return;
        }
        // The mutation is already durable in the journal
        if let Err(e) = self.compact(tenant, journal).await {
            warn!(tenant = %tenant, "Cache index compaction failed: {}", e);
        }
    }
}

/// Apply journal lines in order. A torn last line is dropped.
async fn replay_journal(
    path: &Path,
    records: &mut BTreeMap<String, CachedFileRecord>,
) -> Result<u64> {
    let content = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut applied = 0;

    for (i, line) in lines.iter().enumerate() {
        let entry: JournalEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) if i + 1 == lines.len() => {
                warn!("Ignoring incomplete last entry of {}: {}", path.display(), e);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        match entry {
            JournalEntry::Put { record } => {
                records.insert(record.checksum.clone(), record);
            }
            JournalEntry::Delete { checksum } => {
                records.remove(&checksum);
            }
        }
        applied += 1;
    }
    Ok(applied)
}

#[async_trait]
impl CacheIndex for JsonFileCacheIndex {
    async fn find_by_checksum(
        &self,
        tenant: &TenantId,
        checksum: &str,
    ) -> Result<Option<CachedFileRecord>> {
        self.inner.find_by_checksum(tenant, checksum).await
    }

    async fn find_all_by_checksums(
        &self,
        tenant: &TenantId,
        checksums: &HashSet<String>,
    ) -> Result<Vec<CachedFileRecord>> {
        self.inner.find_all_by_checksums(tenant, checksums).await
    }

    async fn upsert(&self, tenant: &TenantId, mut record: CachedFileRecord) -> Result<UpsertOutcome> {
        let lock = self.journal(tenant);
        let mut journal = lock.lock().await;

        let stored_generation = self
            .inner
            .find_by_checksum(tenant, &record.checksum)
            .await?
            .map(|r| r.generation)
            .unwrap_or(0);
        if stored_generation != record.generation {
            return Ok(UpsertOutcome::Conflict);
        }
        record.generation = stored_generation + 1;

        let entry = JournalEntry::Put {
            record: record.clone(),
        };
        self.append(tenant, &mut journal, &entry, true).await?;
        self.inner.put(tenant, record.clone());

        self.compact_if_grown(tenant, &mut journal).await;
        Ok(UpsertOutcome::Stored(record))
    }

    async fn find_expired_before(
        &self,
        tenant: &TenantId,
        instant: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Page<CachedFileRecord>> {
        self.inner.find_expired_before(tenant, instant, page).await
    }

    async fn find_all(
        &self,
        tenant: &TenantId,
        page: &PageRequest,
    ) -> Result<Page<CachedFileRecord>> {
        self.inner.find_all(tenant, page).await
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        checksum: &str,
        expected_generation: u64,
    ) -> Result<bool> {
        let lock = self.journal(tenant);
        let mut journal = lock.lock().await;

        match self.inner.find_by_checksum(tenant, checksum).await? {
            Some(current) if current.generation == expected_generation => {}
            _ => return Ok(false),
        }

        let entry = JournalEntry::Delete {
            checksum: checksum.to_string(),
        };
        self.append(tenant, &mut journal, &entry, false).await?;
        self.inner.remove(tenant, checksum);

        self.compact_if_grown(tenant, &mut journal).await;
        Ok(true)
    }

    async fn flush(&self, tenant: &TenantId) -> Result<()> {
        let lock = self.journal(tenant);
        let mut journal = lock.lock().await;
        if !journal.unsynced {
            return Ok(());
        }

        match journal.file.as_mut() {
            Some(file) => {
                file.sync_data().await?;
                self.journal_syncs.fetch_add(1, Ordering::Relaxed);
                journal.unsynced = false;
                Ok(())
            }
            // The handle was dropped after a failed write
            None => self.compact(tenant, &mut journal).await,
        }
    }

    async fn total_size_bytes(&self, tenant: &TenantId) -> Result<u64> {
        self.inner.total_size_bytes(tenant).await
    }

    async fn count(&self, tenant: &TenantId) -> Result<u64> {
        self.inner.count(tenant).await
    }
}

// =============================================================================
// Tests
// =============================================================================
