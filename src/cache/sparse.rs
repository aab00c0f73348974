use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use jiff::Timestamp;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::bitmap::{
    bitmap_len, block_count, block_span, coalesce_ranges, count_cached_blocks,
    find_uncached_block_ranges, mark_block_range_cached,
};
use super::meta::{CacheMeta, CachePaths, load_meta, save_meta};
use crate::config::CacheConfig;
use crate::io::{ResourceHead, Upstream};

/// Last-access times are written to disk at most this often per resource
const ACCESS_PERSIST_INTERVAL_MS: i64 = 60_000;

fn now_ms() -> i64 {
    Timestamp::now().as_millisecond()
}

struct Entry {
    meta: CacheMeta,
    bitmap: Vec<u8>,
    paths: CachePaths,
    last_access: i64,
}

/// Bytes returned by [`SparseCache::read_range`] and where they came from
#[derive(Debug, Clone, Default)]
pub struct RangeRead {
    pub bytes: Vec<u8>,
    /// Bytes transferred from upstream to satisfy this read, including coalesced gaps
    pub network_bytes: u64,
    /// Bytes of the result served from the local data file
    pub disk_bytes: u64,
}

/// Cumulative counters across all resources
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub open_resources: usize,
    pub bytes_from_network: u64,
    pub bytes_from_disk: u64,
    pub upstream_requests: u64,
}

/// Coverage of one resource
#[derive(Debug, Clone, Serialize)]
pub struct BookCacheStats {
    pub resource_id: String,
    pub file_size: u64,
    pub block_size: u64,
    pub cached_blocks: u64,
    pub total_blocks: u64,
    pub coverage_percent: f64,
}

/// Disk-backed sparse cache of byte ranges, filled on demand from an [`Upstream`].
///
/// Each resource gets a data file pre-sized to the resource length and a
/// bitmap with one bit per block. The bitmap alone decides whether bytes on
/// disk are meaningful. A bit is set only after its block has been written
/// and synced.
///
/// Concurrent reads of the same resource are not deduplicated: two callers
/// missing the same blocks both fetch them, and the later write simply
/// rewrites identical bytes.
pub struct SparseCache {
    upstream: Arc<dyn Upstream>,
    config: CacheConfig,
    entries: DashMap<String, Arc<Mutex<Entry>>>,
    bytes_from_network: AtomicU64,
    bytes_from_disk: AtomicU64,
    upstream_requests: AtomicU64,
}

impl SparseCache {
    pub fn new(upstream: Arc<dyn Upstream>, config: CacheConfig) -> Self {
        Self {
            upstream,
            config,
            entries: DashMap::new(),
            bytes_from_network: AtomicU64::new(0),
            bytes_from_disk: AtomicU64::new(0),
            upstream_requests: AtomicU64::new(0),
        }
    }

    /// Total size of a resource; only the first call for a resource goes upstream
    pub async fn get_file_size(&self, resource_id: &str) -> Result<u64> {
        let entry = self.entry(resource_id).await?;
        let size = entry.lock().await.meta.file_size;
        Ok(size)
    }

    /// Bytes `start..=end` of a resource, clamped to its length
    pub async fn get_range(&self, resource_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        Ok(self.read_range(resource_id, start, end).await?.bytes)
    }

    /// Like [`get_range`](Self::get_range), also reporting network and disk byte counts
    pub async fn read_range(&self, resource_id: &str, start: u64, end: u64) -> Result<RangeRead> {
        let entry = self.open(resource_id).await?;
        let block_size = self.config.block_size;

        let (file_size, end, gaps, data_path) = {
            let mut e = entry.lock().await;
            let now = now_ms();
            e.last_access = now;
            if now - e.meta.last_accessed_ts >= ACCESS_PERSIST_INTERVAL_MS {
                e.meta.last_accessed_ts = now;
                if let Err(err) = save_meta(&e.paths.meta, &e.meta).await {
                    warn!(resource_id, "cannot persist access time: {:#}", err);
                }
            }

            let file_size = e.meta.file_size;
            if file_size == 0 || start >= file_size || start > end {
                return Ok(RangeRead::default());
            }
            let end = end.min(file_size - 1);
            let uncached = find_uncached_block_ranges(&e.bitmap, start, end, block_size, file_size);
            let gaps = coalesce_ranges(&uncached, self.config.max_coalesce_gap);
            (file_size, end, gaps, e.paths.data.clone())
        };

        let mut buf = vec![0u8; (end - start + 1) as usize];
        let mut network_bytes = 0;
        let mut disk_bytes = 0;

        for &(gap_start, gap_end) in &gaps {
            let bytes = self.fetch_upstream(resource_id, gap_start, gap_end).await?;
            network_bytes += bytes.len() as u64;
            copy_overlap(&mut buf, start, gap_start, &bytes);
            self.store(resource_id, &entry, gap_start, &bytes).await;
        }

        for (run_start, run_end) in uncovered_runs(start, end, &gaps) {
            let len = (run_end - run_start + 1) as usize;
            // A write above may have found the data file replaced and dropped coverage
            if self.is_covered(&entry, run_start, run_end).await {
                match read_at(&data_path, run_start, len).await {
                    Ok(bytes) => {
                        copy_overlap(&mut buf, start, run_start, &bytes);
                        disk_bytes += len as u64;
                        continue;
                    }
                    Err(err) => {
                        warn!(
                            resource_id,
                            "cached bytes {}-{} unreadable, dropping coverage: {:#}",
                            run_start,
                            run_end,
                            err
                        );
                        self.reset_coverage(resource_id, &entry).await;
                    }
                }
            }

            let (fetch_start, fetch_end) = block_span(
                run_start / block_size,
                run_end / block_size,
                block_size,
                file_size,
            );
            let bytes = self
                .fetch_upstream(resource_id, fetch_start, fetch_end)
                .await?;
            network_bytes += bytes.len() as u64;
            copy_overlap(&mut buf, start, fetch_start, &bytes);
            self.store(resource_id, &entry, fetch_start, &bytes).await;
        }

        self.bytes_from_network
            .fetch_add(network_bytes, Ordering::Relaxed);
        self.bytes_from_disk.fetch_add(disk_bytes, Ordering::Relaxed);
        trace!(
            resource_id,
            start,
            end,
            gaps = gaps.len(),
            network_bytes,
            disk_bytes,
            "range served"
        );

        Ok(RangeRead {
            bytes: buf,
            network_bytes,
            disk_bytes,
        })
    }

    /// Drop every cached byte and all metadata of a resource
    pub async fn invalidate(&self, resource_id: &str) -> Result<()> {
        self.entries.remove(resource_id);
        CachePaths::new(&self.config.dir, resource_id)
            .remove_all()
            .await?;
        info!(resource_id, "cache invalidated");
        Ok(())
    }

    /// Check the cache against the origin right now, ignoring the validation interval.
    ///
    /// Returns whether the cached copy was still valid; a stale copy is invalidated.
    pub async fn force_validation(&self, resource_id: &str) -> Result<bool> {
        let entry = self.entry(resource_id).await?;
        let head = self.upstream.head(resource_id).await?;
        let (_, valid) = self.apply_validation(resource_id, entry, &head).await?;
        Ok(valid)
    }

    /// Ids of every resource with metadata in the cache directory, most recently used first
    pub async fn resources(&self) -> Result<Vec<String>> {
        Ok(self
            .resources_by_access()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Keep the `keep_count` most recently used resources and delete the rest.
    ///
    /// Returns the ids of the removed resources.
    pub async fn prune_by_lru(&self, keep_count: usize) -> Result<Vec<String>> {
        let removed: Vec<String> = self
            .resources_by_access()
            .await?
            .into_iter()
            .skip(keep_count)
            .map(|(id, _)| id)
            .collect();
        for id in &removed {
            self.invalidate(id).await?;
        }
        Ok(removed)
    }

    async fn resources_by_access(&self) -> Result<Vec<(String, i64)>> {
        let mut dir = match fs::read_dir(&self.config.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to list cache dir {}", self.config.dir.display())
                });
            }
        };

        let mut resources: Vec<(String, i64)> = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".meta.json") else {
                continue;
            };
            let Ok(Some(meta)) = load_meta(&item.path()).await else {
                continue;
            };
            let id = if meta.resource_id.is_empty() {
                stem.to_string()
            } else {
                meta.resource_id.clone()
            };

            let mut accessed = meta.last_accessed_ts;
            let open = self.entries.get(&id).map(|e| Arc::clone(e.value()));
            if let Some(open) = open {
                accessed = accessed.max(open.lock().await.last_access);
            }
            resources.push((id, accessed));
        }

        resources.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(resources)
    }

    /// Cumulative counters since this cache was created
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            open_resources: self.entries.len(),
            bytes_from_network: self.bytes_from_network.load(Ordering::Relaxed),
            bytes_from_disk: self.bytes_from_disk.load(Ordering::Relaxed),
            upstream_requests: self.upstream_requests.load(Ordering::Relaxed),
        }
    }

    /// Coverage of one resource, or `None` if nothing is cached for it.
    ///
    /// Never goes upstream.
    pub async fn book_stats(&self, resource_id: &str) -> Result<Option<BookCacheStats>> {
        let open = self.entries.get(resource_id).map(|e| Arc::clone(e.value()));
        let (meta, bitmap) = match open {
            Some(entry) => {
                let e = entry.lock().await;
                (e.meta.clone(), e.bitmap.clone())
            }
            None => {
                let paths = CachePaths::new(&self.config.dir, resource_id);
                let Some(meta) = load_meta(&paths.meta).await? else {
                    return Ok(None);
                };
                let bitmap = fs::read(&paths.bitmap).await.unwrap_or_default();
                (meta, bitmap)
            }
        };

        let total_blocks = block_count(meta.file_size, meta.block_size);
        let cached_blocks = count_cached_blocks(&bitmap, total_blocks);
        let coverage_percent = if total_blocks == 0 {
            100.0
        } else {
            cached_blocks as f64 * 100.0 / total_blocks as f64
        };
        Ok(Some(BookCacheStats {
            resource_id: resource_id.to_string(),
            file_size: meta.file_size,
            block_size: meta.block_size,
            cached_blocks,
            total_blocks,
            coverage_percent,
        }))
    }

    /// The entry for a resource, revalidated first if the validation interval has passed
    async fn open(&self, resource_id: &str) -> Result<Arc<Mutex<Entry>>> {
        let entry = self.entry(resource_id).await?;

        let last_validated = entry.lock().await.meta.last_validated_ts;
        let interval = self.config.validation_interval().as_millis() as i64;
        if now_ms() - last_validated < interval {
            return Ok(entry);
        }

        let head = match self.upstream.head(resource_id).await {
            Ok(head) => head,
            Err(err) => {
                warn!(resource_id, "validation skipped, origin unreachable: {:#}", err);
                return Ok(entry);
            }
        };
        let (entry, _) = self.apply_validation(resource_id, entry, &head).await?;
        Ok(entry)
    }

    async fn apply_validation(
        &self,
        resource_id: &str,
        entry: Arc<Mutex<Entry>>,
        head: &ResourceHead,
    ) -> Result<(Arc<Mutex<Entry>>, bool)> {
        {
            let mut e = entry.lock().await;
            if e.meta.matches(head) {
                e.meta.last_validated_ts = now_ms();
                if let Err(err) = save_meta(&e.paths.meta, &e.meta).await {
                    warn!(resource_id, "cannot persist validation time: {:#}", err);
                }
                drop(e);
                return Ok((entry, true));
            }
        }

        info!(resource_id, "cached copy is stale");
        self.invalidate(resource_id).await?;
        let fresh = Arc::new(Mutex::new(self.create_entry(resource_id, head).await?));
        self.entries
            .insert(resource_id.to_string(), Arc::clone(&fresh));
        Ok((fresh, false))
    }

    async fn entry(&self, resource_id: &str) -> Result<Arc<Mutex<Entry>>> {
        if let Some(entry) = self.entries.get(resource_id) {
            return Ok(Arc::clone(entry.value()));
        }

        let entry = match self.load_entry(resource_id).await? {
            Some(entry) => entry,
            None => {
                let head = self.upstream.head(resource_id).await?;
                self.create_entry(resource_id, &head).await?
            }
        };

        let shared = self
            .entries
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(entry)));
        Ok(Arc::clone(shared.value()))
    }

    /// Load a resource's entry from disk, discarding anything inconsistent
    async fn load_entry(&self, resource_id: &str) -> Result<Option<Entry>> {
        let paths = CachePaths::new(&self.config.dir, resource_id);
        let meta = match load_meta(&paths.meta).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(resource_id, "discarding unreadable cache metadata: {:#}", err);
                paths.remove_all().await?;
                return Ok(None);
            }
        };

        if meta.block_size != self.config.block_size {
            debug!(
                resource_id,
                cached = meta.block_size,
                configured = self.config.block_size,
                "block size changed, discarding cache"
            );
            paths.remove_all().await?;
            return Ok(None);
        }

        let expected_len = bitmap_len(meta.file_size, meta.block_size);
        let data_ok = fs::metadata(&paths.data)
            .await
            .is_ok_and(|m| m.len() == meta.file_size);
        let bitmap = match fs::read(&paths.bitmap).await {
            Ok(bitmap) if data_ok && bitmap.len() == expected_len => bitmap,
            _ => {
                debug!(resource_id, "data file or bitmap inconsistent, resetting coverage");
                prepare_data_file(&paths.data, meta.file_size).await?;
                let bitmap = vec![0u8; expected_len];
                fs::write(&paths.bitmap, &bitmap)
                    .await
                    .with_context(|| format!("failed to write {}", paths.bitmap.display()))?;
                bitmap
            }
        };

        let last_access = meta.last_accessed_ts;
        Ok(Some(Entry {
            meta,
            bitmap,
            paths,
            last_access,
        }))
    }

    async fn create_entry(&self, resource_id: &str, head: &ResourceHead) -> Result<Entry> {
        fs::create_dir_all(&self.config.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.config.dir.display()))?;

        let paths = CachePaths::new(&self.config.dir, resource_id);
        let now = now_ms();
        let meta = CacheMeta::from_head(resource_id, head, self.config.block_size, now);

        prepare_data_file(&paths.data, meta.file_size).await?;
        let bitmap = vec![0u8; bitmap_len(meta.file_size, meta.block_size)];
        fs::write(&paths.bitmap, &bitmap)
            .await
            .with_context(|| format!("failed to write {}", paths.bitmap.display()))?;
        save_meta(&paths.meta, &meta).await?;

        info!(resource_id, size = meta.file_size, "cache entry created");
        Ok(Entry {
            meta,
            bitmap,
            paths,
            last_access: now,
        })
    }

    async fn fetch_upstream(&self, resource_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        self.upstream_requests.fetch_add(1, Ordering::Relaxed);
        debug!(resource_id, start, end, "fetching from upstream");

        let mut bytes = self.upstream.get_range(resource_id, start, end).await?;
        let expected = (end - start + 1) as usize;
        if bytes.len() < expected {
            bail!(
                "short read from upstream for {} bytes {}-{}: expected {} bytes, got {}",
                resource_id,
                start,
                end,
                expected,
                bytes.len()
            );
        }
        bytes.truncate(expected);
        Ok(bytes)
    }

    async fn is_covered(&self, entry: &Mutex<Entry>, start: u64, end: u64) -> bool {
        let e = entry.lock().await;
        find_uncached_block_ranges(&e.bitmap, start, end, e.meta.block_size, e.meta.file_size)
            .is_empty()
    }

    /// Forget every cached block of a resource and lay down a fresh data file
    async fn reset_coverage(&self, resource_id: &str, entry: &Mutex<Entry>) {
        let mut e = entry.lock().await;
        e.bitmap.fill(0);
        if let Err(err) = fs::write(&e.paths.bitmap, &e.bitmap).await {
            warn!(resource_id, "cannot persist bitmap: {:#}", err);
        }
        if let Err(err) = prepare_data_file(&e.paths.data, e.meta.file_size).await {
            warn!(resource_id, "cannot recreate cache data file: {:#}", err);
        }
    }

    /// Write fetched bytes into the data file, then mark the fully covered blocks.
    ///
    /// Failures are logged and mark nothing, so the bytes will simply be
    /// fetched again next time.
    async fn store(&self, resource_id: &str, entry: &Mutex<Entry>, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut e = entry.lock().await;
        let file_size = e.meta.file_size;
        let replaced = match prepare_data_file(&e.paths.data, file_size).await {
            Ok(replaced) => replaced,
            Err(err) => {
                warn!(resource_id, "cannot open cache data file: {:#}", err);
                return;
            }
        };
        if replaced {
            // Recreated or resized: nothing else in the file is what the bitmap says
            warn!(resource_id, "cache data file was replaced, dropping coverage");
            e.bitmap.fill(0);
            if let Err(err) = fs::write(&e.paths.bitmap, &e.bitmap).await {
                warn!(resource_id, "cannot persist bitmap: {:#}", err);
            }
        }
        if let Err(err) = write_at(&e.paths.data, offset, bytes).await {
            warn!(resource_id, "cannot write cache data at {}: {:#}", offset, err);
            return;
        }

        let block_size = e.meta.block_size;
        let end = offset + bytes.len() as u64;
        let first = offset.div_ceil(block_size);
        let last_exclusive = if end >= file_size {
            block_count(file_size, block_size)
        } else {
            end / block_size
        };
        if first >= last_exclusive {
            return;
        }
        mark_block_range_cached(&mut e.bitmap, first, last_exclusive - 1);
        if let Err(err) = fs::write(&e.paths.bitmap, &e.bitmap).await {
            warn!(resource_id, "cannot persist bitmap: {:#}", err);
        }
    }
}

/// Parts of `start..=end` not covered by any of the sorted `ranges`
fn uncovered_runs(start: u64, end: u64, ranges: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut runs = Vec::new();
    let mut cursor = start;
    for &(range_start, range_end) in ranges {
        if cursor > end {
            break;
        }
        if range_start > cursor {
            runs.push((cursor, (range_start - 1).min(end)));
        }
        cursor = cursor.max(range_end + 1);
    }
    if cursor <= end {
        runs.push((cursor, end));
    }
    runs
}

/// Copy the part of `src` (starting at absolute offset `src_start`) that falls
/// inside `dst` (starting at absolute offset `dst_start`)
fn copy_overlap(dst: &mut [u8], dst_start: u64, src_start: u64, src: &[u8]) {
    let from = dst_start.max(src_start);
    let to = (dst_start + dst.len() as u64).min(src_start + src.len() as u64);
    if from >= to {
        return;
    }
    let len = (to - from) as usize;
    let d = (from - dst_start) as usize;
    let s = (from - src_start) as usize;
    dst[d..d + len].copy_from_slice(&src[s..s + len]);
}

/// Make sure the data file exists with the resource's length, returning
/// whether it had to be created or resized
async fn prepare_data_file(path: &Path, size: u64) -> Result<bool> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let resized = file.metadata().await?.len() != size;
    if resized {
        file.set_len(size).await?;
    }
    Ok(resized)
}

async fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    Ok(())
}

async fn read_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::TempDir;

    struct FakeUpstream {
        content: Vec<u8>,
        etag: SyncMutex<String>,
        calls: SyncMutex<Vec<(u64, u64)>>,
        heads: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeUpstream {
        fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                content: (0..len).map(|i| (i % 251) as u8).collect(),
                etag: SyncMutex::new("\"v1\"".to_string()),
                calls: SyncMutex::new(Vec::new()),
                heads: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn take_calls(&self) -> Vec<(u64, u64)> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn head(&self, _resource_id: &str) -> Result<ResourceHead> {
            self.heads.fetch_add(1, Ordering::SeqCst);
            Ok(ResourceHead {
                size: self.content.len() as u64,
                etag: Some(self.etag.lock().clone()),
                last_modified: None,
            })
        }

        async fn get_range(&self, _resource_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("All 3 mirrors failed for resource test");
            }
            self.calls.lock().push((start, end));
            Ok(self.content[start as usize..=end as usize].to_vec())
        }
    }

    fn cache_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            dir: dir.path().to_path_buf(),
            block_size: 64,
            max_coalesce_gap: 128,
            ..Default::default()
        }
    }

    fn cache(upstream: &Arc<FakeUpstream>, dir: &TempDir) -> SparseCache {
        SparseCache::new(upstream.clone(), cache_config(dir))
    }

    #[tokio::test]
    async fn only_missing_blocks_go_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);

        assert_eq!(cache.get_range("b", 0, 63).await.unwrap(), &upstream.content[0..64]);
        assert_eq!(upstream.take_calls(), [(0, 63)]);

        assert_eq!(cache.get_range("b", 0, 127).await.unwrap(), &upstream.content[0..128]);
        assert_eq!(upstream.take_calls(), [(64, 127)]);

        let read = cache.read_range("b", 10, 100).await.unwrap();
        assert_eq!(read.bytes, &upstream.content[10..=100]);
        assert_eq!(read.network_bytes, 0);
        assert_eq!(read.disk_bytes, 91);
        assert!(upstream.take_calls().is_empty());
    }

    #[tokio::test]
    async fn small_cached_gaps_are_refetched_in_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 64, 127).await.unwrap();
        cache.get_range("b", 192, 255).await.unwrap();
        upstream.take_calls();

        let bytes = cache.get_range("b", 0, 319).await.unwrap();
        assert_eq!(bytes, &upstream.content[0..320]);
        assert_eq!(upstream.take_calls(), [(0, 319)]);
    }

    #[tokio::test]
    async fn large_cached_gaps_split_requests() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(1024);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 64, 319).await.unwrap();
        upstream.take_calls();

        let bytes = cache.get_range("b", 0, 400).await.unwrap();
        assert_eq!(bytes, &upstream.content[0..=400]);
        assert_eq!(upstream.take_calls(), [(0, 63), (320, 447)]);
    }

    #[tokio::test]
    async fn requests_are_clamped_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(500);
        let cache = cache(&upstream, &dir);

        let tail = cache.get_range("b", 490, 10_000).await.unwrap();
        assert_eq!(tail, &upstream.content[490..500]);
        assert_eq!(upstream.take_calls(), [(448, 499)]);

        assert!(cache.get_range("b", 500, 600).await.unwrap().is_empty());
        assert!(cache.get_range("b", 20, 10).await.unwrap().is_empty());
        assert!(upstream.take_calls().is_empty());
        assert_eq!(cache.get_file_size("b").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn coverage_never_shrinks_while_reading() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(640);
        let cache = cache(&upstream, &dir);

        let mut previous = 0;
        for (start, end) in [(0, 10), (300, 400), (0, 639), (100, 120)] {
            cache.get_range("b", start, end).await.unwrap();
            let stats = cache.book_stats("b").await.unwrap().unwrap();
            assert!(stats.cached_blocks >= previous);
            previous = stats.cached_blocks;
        }
        let stats = cache.book_stats("b").await.unwrap().unwrap();
        assert_eq!(stats.total_blocks, 10);
        assert_eq!(stats.cached_blocks, 10);
        assert!((stats.coverage_percent - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unreadable_data_file_falls_back_to_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 0, 127).await.unwrap();
        upstream.take_calls();
        std::fs::remove_file(dir.path().join("b.txt")).unwrap();

        let bytes = cache.get_range("b", 5, 100).await.unwrap();
        assert_eq!(bytes, &upstream.content[5..=100]);
        assert_eq!(upstream.take_calls(), [(0, 127)]);

        // The refetch repopulated the data file
        let again = cache.read_range("b", 5, 100).await.unwrap();
        assert_eq!(again.bytes, &upstream.content[5..=100]);
        assert_eq!(again.network_bytes, 0);
    }

    #[tokio::test]
    async fn lost_data_file_drops_all_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 0, 255).await.unwrap();
        upstream.take_calls();
        std::fs::remove_file(dir.path().join("b.txt")).unwrap();

        assert_eq!(cache.get_range("b", 0, 63).await.unwrap(), &upstream.content[0..64]);
        assert_eq!(upstream.take_calls(), [(0, 63)]);
        let stats = cache.book_stats("b").await.unwrap().unwrap();
        assert_eq!(stats.cached_blocks, 1);

        // Blocks cached before the loss are fetched again, not served as zeros
        let bytes = cache.get_range("b", 128, 255).await.unwrap();
        assert_eq!(bytes, &upstream.content[128..256]);
        assert_eq!(upstream.take_calls(), [(128, 255)]);
    }

    #[tokio::test]
    async fn read_spanning_lost_blocks_refetches_them() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(1024);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 0, 63).await.unwrap();
        cache.get_range("b", 512, 575).await.unwrap();
        upstream.take_calls();
        std::fs::remove_file(dir.path().join("b.txt")).unwrap();

        let bytes = cache.get_range("b", 0, 575).await.unwrap();
        assert_eq!(bytes, &upstream.content[0..576]);
        assert_eq!(upstream.take_calls(), [(64, 511), (0, 63), (512, 575)]);
    }

    #[tokio::test]
    async fn replaced_data_file_drops_coverage_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 0, 127).await.unwrap();
        std::fs::remove_file(dir.path().join("b.txt")).unwrap();
        upstream.take_calls();

        // Only uncached blocks are read, so the loss is noticed by the write
        cache.get_range("b", 256, 319).await.unwrap();
        assert_eq!(upstream.take_calls(), [(256, 319)]);
        let stats = cache.book_stats("b").await.unwrap().unwrap();
        assert_eq!(stats.cached_blocks, 1);

        assert_eq!(cache.get_range("b", 0, 127).await.unwrap(), &upstream.content[0..128]);
        assert_eq!(upstream.take_calls(), [(0, 127)]);
    }

    #[tokio::test]
    async fn upstream_errors_propagate_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);
        cache.get_range("b", 0, 63).await.unwrap();

        upstream.fail.store(true, Ordering::SeqCst);
        let err = cache.get_range("b", 0, 200).await.unwrap_err();
        assert!(err.to_string().contains("mirrors failed"));

        // Cached bytes are still served without the network
        assert_eq!(cache.get_range("b", 0, 63).await.unwrap(), &upstream.content[0..64]);
    }

    #[tokio::test]
    async fn cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        cache(&upstream, &dir).get_range("b", 0, 255).await.unwrap();
        upstream.take_calls();
        let heads = upstream.heads.load(Ordering::SeqCst);

        let reopened = cache(&upstream, &dir);
        assert_eq!(reopened.get_range("b", 0, 255).await.unwrap(), &upstream.content[0..256]);
        assert!(upstream.take_calls().is_empty());
        assert_eq!(upstream.heads.load(Ordering::SeqCst), heads);
    }

    #[tokio::test]
    async fn stale_etag_invalidates_whole_resource() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = SparseCache::new(
            upstream.clone(),
            CacheConfig {
                validation_interval_ms: 0,
                ..cache_config(&dir)
            },
        );

        cache.get_range("b", 0, 511).await.unwrap();
        upstream.take_calls();
        cache.get_range("b", 0, 63).await.unwrap();
        assert!(upstream.take_calls().is_empty());

        *upstream.etag.lock() = "\"v2\"".to_string();
        cache.get_range("b", 0, 63).await.unwrap();
        assert_eq!(upstream.take_calls(), [(0, 63)]);
        let stats = cache.book_stats("b").await.unwrap().unwrap();
        assert_eq!(stats.cached_blocks, 1);
    }

    #[tokio::test]
    async fn validation_waits_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 0, 63).await.unwrap();
        cache.get_range("b", 64, 127).await.unwrap();
        assert_eq!(upstream.heads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_validation_reports_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);
        cache.get_range("b", 0, 127).await.unwrap();

        assert!(cache.force_validation("b").await.unwrap());
        assert_eq!(cache.book_stats("b").await.unwrap().unwrap().cached_blocks, 2);

        *upstream.etag.lock() = "\"changed\"".to_string();
        assert!(!cache.force_validation("b").await.unwrap());
        assert_eq!(cache.book_stats("b").await.unwrap().unwrap().cached_blocks, 0);
    }

    #[tokio::test]
    async fn invalidate_removes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);
        cache.get_range("b", 0, 10).await.unwrap();
        assert!(dir.path().join("b.txt").exists());
        assert!(dir.path().join("b.bitmap").exists());
        assert!(dir.path().join("b.meta.json").exists());

        cache.invalidate("b").await.unwrap();
        assert!(!dir.path().join("b.txt").exists());
        assert!(!dir.path().join("b.bitmap").exists());
        assert!(!dir.path().join("b.meta.json").exists());
        assert!(cache.book_stats("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_most_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(256);
        let cache = cache(&upstream, &dir);

        for id in ["1", "2", "3"] {
            cache.get_range(id, 0, 10).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cache.get_range("1", 0, 10).await.unwrap();

        assert_eq!(cache.resources().await.unwrap(), ["1", "3", "2"]);
        let removed = cache.prune_by_lru(2).await.unwrap();
        assert_eq!(removed, ["2"]);
        assert!(cache.book_stats("2").await.unwrap().is_none());
        assert!(cache.book_stats("1").await.unwrap().is_some());
        assert!(cache.book_stats("3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_accumulate_network_and_disk_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(512);
        let cache = cache(&upstream, &dir);

        cache.get_range("b", 0, 63).await.unwrap();
        cache.get_range("b", 0, 63).await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.bytes_from_network, 64);
        assert_eq!(stats.bytes_from_disk, 64);
        assert_eq!(stats.upstream_requests, 1);
        assert_eq!(stats.open_resources, 1);
    }

    #[test]
    fn uncovered_runs_fill_between_ranges() {
        assert_eq!(uncovered_runs(0, 99, &[]), [(0, 99)]);
        assert_eq!(uncovered_runs(10, 99, &[(0, 63)]), [(64, 99)]);
        assert_eq!(uncovered_runs(0, 99, &[(10, 19), (50, 200)]), [(0, 9), (20, 49)]);
        assert!(uncovered_runs(0, 99, &[(0, 127)]).is_empty());
    }
}
