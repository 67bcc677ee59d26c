use crate::db::{DbPool, SearchStringRepo, TerminalFailureKind, VideoCacheRepo, VideoCacheRow};
use crate::error::AppResult;
use crate::music::track::TrackMetadata;
use crate::storage::ObjectStorageClient;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Deterministic 64-bit FNV-1a, used to content-address cache files by URL
fn fnv1a64(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Lower-cased, whitespace-collapsed form used as the search memo key
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Result of a cache lookup
#[derive(Debug)]
pub enum CacheLookup {
    Miss,
    Hit(VideoCacheRow),
    /// URL previously failed terminally; callers fail fast
    KnownFailure(TerminalFailureKind),
}

/// Content-addressed file store keyed by canonical URL.
///
/// Metadata lives in the relational store, bytes under `cache_dir`, and an
/// optional object-storage mirror holds backups. The in-transit set
/// reference-counts entries between lookup and playback so LRU marking can
/// never delete a file someone is about to link.
pub struct DownloadCache {
    pool: DbPool,
    cache_dir: PathBuf,
    max_entries: u32,
    max_search_entries: u32,
    storage: Option<Arc<ObjectStorageClient>>,
    in_transit: Mutex<HashMap<String, usize>>,
}

impl DownloadCache {
    pub fn new(
        pool: DbPool,
        cache_dir: PathBuf,
        max_entries: u32,
        max_search_entries: u32,
        storage: Option<Arc<ObjectStorageClient>>,
    ) -> Self {
        Self {
            pool,
            cache_dir,
            max_entries,
            max_search_entries,
            storage,
            in_transit: Mutex::new(HashMap::new()),
        }
    }

    /// Where the source file for a URL lives
    pub fn source_path_for(&self, url: &str, ext: &str) -> PathBuf {
        self.cache_dir.join(format!("{:016x}.{ext}", fnv1a64(url)))
    }

    /// Look a canonical URL up, bumping last_iterated_at on hit. Entries
    /// marked for delete are treated as misses; terminal-failure sentinels
    /// come back as KnownFailure.
    pub async fn lookup(&self, url: &str) -> AppResult<CacheLookup> {
        let Some(row) = VideoCacheRepo::get_by_url(&self.pool, url).await? else {
            return Ok(CacheLookup::Miss);
        };
        if let Some(kind) = row.failure() {
            return Ok(CacheLookup::KnownFailure(kind));
        }
        if row.marked_for_delete || !Path::new(&row.path).exists() {
            return Ok(CacheLookup::Miss);
        }
        VideoCacheRepo::touch(&self.pool, url).await?;
        Ok(CacheLookup::Hit(row))
    }

    /// Adopt a freshly downloaded file: move it to its content-addressed
    /// home and upsert the row. Idempotent on URL.
    pub async fn adopt(
        &self,
        url: &str,
        downloaded_path: &Path,
        metadata: &TrackMetadata,
    ) -> AppResult<VideoCacheRow> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let ext = downloaded_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp3");
        let target = self.source_path_for(url, ext);
        if downloaded_path != target {
            // Rename fails across filesystems; fall back to copy + unlink
            if tokio::fs::rename(downloaded_path, &target).await.is_err() {
                tokio::fs::copy(downloaded_path, &target).await?;
                let _ = tokio::fs::remove_file(downloaded_path).await;
            }
        }
        let row = VideoCacheRepo::upsert(
            &self.pool,
            url,
            &target.to_string_lossy(),
            &metadata.title,
            &metadata.uploader,
            i64::from(metadata.duration_s),
        )
        .await?;
        Ok(row)
    }

    /// Record a terminal download failure so repeats short-circuit
    pub async fn record_terminal_failure(
        &self,
        url: &str,
        kind: TerminalFailureKind,
    ) -> AppResult<()> {
        VideoCacheRepo::record_failure(&self.pool, url, kind).await
    }

    /// Hold an entry in the in-transit set while a download/playback path
    /// references it
    pub fn begin_use(&self, url: &str) {
        let mut in_transit = self.in_transit.lock().unwrap();
        *in_transit.entry(url.to_string()).or_insert(0) += 1;
    }

    /// Release one in-transit reference
    pub fn end_use(&self, url: &str) {
        let mut in_transit = self.in_transit.lock().unwrap();
        if let Some(count) = in_transit.get_mut(url) {
            *count -= 1;
            if *count == 0 {
                in_transit.remove(url);
            }
        }
    }

    fn in_transit_urls(&self) -> Vec<String> {
        self.in_transit.lock().unwrap().keys().cloned().collect()
    }

    pub fn is_in_transit(&self, url: &str) -> bool {
        self.in_transit.lock().unwrap().contains_key(url)
    }

    /// Memoized free-text resolution
    pub async fn search_lookup(&self, query: &str) -> AppResult<Option<String>> {
        SearchStringRepo::lookup(&self.pool, &normalize_query(query)).await
    }

    pub async fn search_insert(&self, query: &str, url: &str) -> AppResult<()> {
        SearchStringRepo::upsert(&self.pool, &normalize_query(query), url).await
    }

    /// Mark LRU entries beyond the cap for deletion, skipping in-transit
    /// entries
    pub async fn mark_lru_for_delete(&self) -> AppResult<u64> {
        let count = VideoCacheRepo::count(&self.pool).await?;
        let excess = count - i64::from(self.max_entries);
        if excess < 1 {
            return Ok(0);
        }
        let protected = self.in_transit_urls();
        let marked = VideoCacheRepo::mark_lru_for_delete(&self.pool, excess, &protected).await?;
        if marked > 0 {
            info!(marked, "Marked cache entries for deletion");
        }
        Ok(marked)
    }

    /// Marked entries whose sources are no longer referenced
    pub async fn collect_deletable(&self) -> AppResult<Vec<VideoCacheRow>> {
        let rows = VideoCacheRepo::marked_for_delete(&self.pool).await?;
        Ok(rows
            .into_iter()
            .filter(|row| !self.is_in_transit(&row.url))
            .collect())
    }

    /// Delete files, remote backups and rows for collected entries
    pub async fn delete_entries(&self, rows: Vec<VideoCacheRow>) -> AppResult<usize> {
        let mut deleted = 0;
        for row in rows {
            if self.is_in_transit(&row.url) {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(&row.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %row.path, error = %e, "Failed deleting cache file");
                    continue;
                }
            }
            if let (Some(storage), Some(key)) = (&self.storage, &row.backup_key) {
                if let Err(e) = storage.delete(key).await {
                    warn!(key, error = %e, "Failed deleting backup object");
                }
            }
            VideoCacheRepo::delete_by_url(&self.pool, &row.url).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Evict excess memoized search strings
    pub async fn prune_search(&self) -> AppResult<u64> {
        SearchStringRepo::prune(&self.pool, i64::from(self.max_search_entries)).await
    }

    /// Upload un-backed-up entries, recording their object keys. Failures
    /// leave entries un-backed-up for the next sweep.
    pub async fn backup_pending(&self, limit: u32) -> AppResult<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let rows = VideoCacheRepo::pending_backup(&self.pool, i64::from(limit)).await?;
        let mut uploaded = 0;
        for row in rows {
            let path = PathBuf::from(&row.path);
            let Some(key) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            match storage.put(&key, &path).await {
                Ok(()) => {
                    VideoCacheRepo::set_backup_key(&self.pool, &row.url, &key).await?;
                    uploaded += 1;
                }
                Err(e) => {
                    warn!(url = %row.url, error = %e, "Backup upload failed, will retry");
                }
            }
        }
        Ok(uploaded)
    }

    /// Startup sweep: restore rows whose files vanished (from backup when
    /// possible, otherwise drop the row) and unlink files no row references.
    pub async fn verify(&self) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let rows = VideoCacheRepo::all_entries(&self.pool).await?;
        let mut referenced: Vec<PathBuf> = Vec::with_capacity(rows.len());

        for row in rows {
            let path = PathBuf::from(&row.path);
            if path.exists() {
                referenced.push(path);
                continue;
            }
            let restored = match (&self.storage, &row.backup_key) {
                (Some(storage), Some(key)) => match storage.get(key).await {
                    Ok(bytes) => {
                        tokio::fs::write(&path, bytes).await?;
                        debug!(url = %row.url, "Restored cache file from backup");
                        true
                    }
                    Err(e) => {
                        warn!(url = %row.url, error = %e, "Backup restore failed");
                        false
                    }
                },
                _ => false,
            };
            if restored {
                referenced.push(path);
            } else {
                VideoCacheRepo::delete_by_url(&self.pool, &row.url).await?;
            }
        }

        let mut dir = tokio::fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            if !referenced.contains(&path) {
                debug!(path = %path.display(), "Removing unreferenced cache file");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }

    /// Random cached URLs for random-play's cache-only pool
    pub async fn random_urls(&self, limit: i64) -> AppResult<Vec<(String, String)>> {
        let rows = VideoCacheRepo::random_entries(&self.pool, limit).await?;
        Ok(rows.into_iter().map(|r| (r.url, r.title)).collect())
    }
}

impl std::fmt::Debug for DownloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCache")
            .field("cache_dir", &self.cache_dir)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
