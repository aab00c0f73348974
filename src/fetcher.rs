//! Per-resource façade over the shared [`SparseCache`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use tracing::warn;

use crate::cache::{BookCacheStats, SparseCache};
use crate::config::FetcherConfig;
use crate::io::ByteSource;

/// Counters for a debug panel; they never influence fetching
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchStats {
    pub resource_id: String,
    pub requests: u64,
    pub bytes_downloaded: u64,
    pub bytes_from_network: u64,
    pub bytes_from_disk: u64,
    /// Share of returned bytes served from disk, in percent
    pub cache_efficiency: f64,
}

/// A [`ByteSource`] for one resource, reading through the sparse cache.
///
/// Whole `fetch_range` calls are retried with exponential backoff, which
/// covers transient mirror failures the cache itself does not retry.
pub struct CachedFetcher {
    resource_id: String,
    cache: Arc<SparseCache>,
    config: FetcherConfig,
    requests: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_from_network: AtomicU64,
    bytes_from_disk: AtomicU64,
}

impl CachedFetcher {
    pub fn new(resource_id: impl Into<String>, cache: Arc<SparseCache>, config: FetcherConfig) -> Self {
        Self {
            resource_id: resource_id.into(),
            cache,
            config,
            requests: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            bytes_from_network: AtomicU64::new(0),
            bytes_from_disk: AtomicU64::new(0),
        }
    }

    pub async fn get_file_size(&self) -> Result<u64> {
        self.cache.get_file_size(&self.resource_id).await
    }

    /// Bytes `start..=end`, clamped to the resource
    pub async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let backoff = ExponentialBuilder::default()
            .with_max_times(self.config.max_retries)
            .with_min_delay(Duration::from_millis(self.config.min_backoff_ms))
            .with_max_delay(Duration::from_millis(self.config.max_backoff_ms));

        let read = (|| self.cache.read_range(&self.resource_id, start, end))
            .retry(backoff)
            .notify(|err, delay| {
                warn!(
                    resource_id = %self.resource_id,
                    "range {}-{} failed, retrying in {:?}: {:#}", start, end, delay, err
                );
            })
            .await?;

        self.bytes_downloaded
            .fetch_add(read.bytes.len() as u64, Ordering::Relaxed);
        self.bytes_from_network
            .fetch_add(read.network_bytes, Ordering::Relaxed);
        self.bytes_from_disk
            .fetch_add(read.disk_bytes, Ordering::Relaxed);
        Ok(read.bytes)
    }

    pub fn get_stats(&self) -> FetchStats {
        let bytes_from_network = self.bytes_from_network.load(Ordering::Relaxed);
        let bytes_from_disk = self.bytes_from_disk.load(Ordering::Relaxed);
        let served = bytes_from_network + bytes_from_disk;
        let cache_efficiency = if served == 0 {
            0.0
        } else {
            bytes_from_disk as f64 * 100.0 / served as f64
        };

        FetchStats {
            resource_id: self.resource_id.clone(),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_from_network,
            bytes_from_disk,
            cache_efficiency,
        }
    }

    pub async fn get_cache_stats(&self) -> Result<Option<BookCacheStats>> {
        self.cache.book_stats(&self.resource_id).await
    }

    pub async fn invalidate_cache(&self) -> Result<()> {
        self.cache.invalidate(&self.resource_id).await
    }

    /// Revalidate against the origin now; returns whether the cache was still valid
    pub async fn validate_cache(&self) -> Result<bool> {
        self.cache.force_validation(&self.resource_id).await
    }
}

#[async_trait]
impl ByteSource for CachedFetcher {
    async fn size(&self) -> Result<u64> {
        self.get_file_size().await
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        CachedFetcher::fetch_range(self, start, end).await
    }
}
