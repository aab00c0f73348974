use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::position::{Boundaries, Position};
use super::words::{Stop, Window, extract_last_words, extract_words};
use crate::config::NavigatorConfig;
use crate::io::ByteSource;

/// Smallest window requested for a chunk, in bytes
const MIN_WINDOW: u64 = 64;

struct CachedChunk {
    requested_from: u64,
    chunk_size: usize,
    position: Position,
}

/// Running average of bytes consumed per word
struct WordStats {
    bytes: u64,
    words: u64,
    initial: f64,
}

impl WordStats {
    fn bytes_per_word(&self) -> f64 {
        if self.words == 0 {
            self.initial
        } else {
            self.bytes as f64 / self.words as f64
        }
    }
}

/// Turns byte offsets into [`Position`]s and remembers recent ones.
///
/// Cheap to clone; clones share the source, the chunk LRU and the
/// bytes-per-word estimate, which lets prefetch tasks fill the same LRU.
pub(crate) struct ChunkLoader<S: ?Sized> {
    source: Arc<S>,
    resource: String,
    boundaries: Boundaries,
    overfetch_factor: f64,
    utf8_margin: u64,
    chunks: Arc<Mutex<LruCache<String, CachedChunk>>>,
    word_stats: Arc<Mutex<WordStats>>,
}

impl<S: ?Sized> Clone for ChunkLoader<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            resource: self.resource.clone(),
            boundaries: self.boundaries,
            overfetch_factor: self.overfetch_factor,
            utf8_margin: self.utf8_margin,
            chunks: Arc::clone(&self.chunks),
            word_stats: Arc::clone(&self.word_stats),
        }
    }
}

impl<S: ByteSource + ?Sized + 'static> ChunkLoader<S> {
    pub fn new(
        source: Arc<S>,
        resource: String,
        boundaries: Boundaries,
        config: &NavigatorConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.lru_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            resource,
            boundaries,
            overfetch_factor: config.overfetch_factor.max(1.0),
            utf8_margin: config.utf8_margin,
            chunks: Arc::new(Mutex::new(LruCache::new(capacity))),
            word_stats: Arc::new(Mutex::new(WordStats {
                bytes: 0,
                words: 0,
                initial: config.initial_bytes_per_word.max(1.0),
            })),
        }
    }

    pub fn bytes_per_word(&self) -> f64 {
        self.word_stats.lock().bytes_per_word()
    }

    /// Expected byte length of `chunk_size` words
    pub fn expected_bytes(&self, chunk_size: usize) -> u64 {
        (chunk_size as f64 * self.bytes_per_word()).ceil().max(1.0) as u64
    }

    pub fn cached_chunks(&self) -> usize {
        self.chunks.lock().len()
    }

    /// The chunk of `chunk_size` words starting at `from`, from the LRU when possible
    pub async fn load(&self, from: u64, chunk_size: usize, word_index: u64) -> Result<Position> {
        if let Some(position) = self.cached(from, chunk_size) {
            trace!(resource = %self.resource, from, "chunk cache hit");
            return Ok(Position {
                word_index,
                ..position
            });
        }

        let position = self.materialize(from, chunk_size, word_index).await?;
        if !position.words.is_empty() {
            let key = format!("{}:{}:{}", self.resource, position.byte_start, position.byte_end);
            self.chunks.lock().put(
                key,
                CachedChunk {
                    requested_from: from,
                    chunk_size,
                    position: position.clone(),
                },
            );
        }
        Ok(position)
    }

    /// The last `chunk_size` words ending before `stop`, looking back at most
    /// `window` bytes. Bypasses the LRU.
    ///
    /// The chunk is anchored to end right before `stop`, so its
    /// `next_byte_start` is `stop`. `None` when no complete word fits.
    pub async fn load_ending_at(
        &self,
        stop: u64,
        chunk_size: usize,
        window: u64,
    ) -> Result<Option<Position>> {
        let bounds = self.boundaries;
        let stop = stop.min(bounds.end_byte);
        let from = stop.saturating_sub(window).max(bounds.start_byte);
        if from >= stop {
            return Ok(None);
        }

        let fetch_start = from.saturating_sub(self.utf8_margin).max(bounds.start_byte);
        // One byte past `stop` shows whether the last word runs into it
        let fetch_end = stop.saturating_add(1).min(bounds.end_byte);
        let bytes = self.source.fetch_range(fetch_start, fetch_end - 1).await?;
        let extracted = extract_last_words(
            Window {
                bytes: &bytes,
                offset: fetch_start,
                text_start: bounds.start_byte,
                stop,
                is_final: fetch_start + bytes.len() as u64 >= bounds.end_byte,
            },
            from,
            chunk_size,
        );
        let (Some(first), Some(last)) = (extracted.first_word_start, extracted.last_word_end)
        else {
            return Ok(None);
        };

        debug!(
            resource = %self.resource,
            stop,
            fetched = bytes.len(),
            words = extracted.words.len(),
            "chunk materialized backwards"
        );
        {
            let mut stats = self.word_stats.lock();
            stats.bytes += last + 1 - first;
            stats.words += extracted.words.len() as u64;
        }
        Ok(Some(self.position(
            first,
            chunk_size,
            0,
            extracted.words,
            Some(stop - 1),
            stop >= bounds.end_byte,
        )))
    }

    /// Warm the LRU with the chunk at `from` after `delay`; errors are dropped
    pub fn prefetch(&self, from: u64, chunk_size: usize, word_index: u64, delay: Duration) {
        let loader = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = loader.load(from, chunk_size, word_index).await {
                trace!(resource = %loader.resource, from, "prefetch failed: {:#}", err);
            }
        });
    }

    fn cached(&self, from: u64, chunk_size: usize) -> Option<Position> {
        let mut chunks = self.chunks.lock();
        let key = chunks
            .iter()
            .find(|(_, c)| c.requested_from == from && c.chunk_size == chunk_size)
            .map(|(key, _)| key.clone())?;
        chunks.get(&key).map(|c| c.position.clone())
    }

    async fn materialize(&self, from: u64, chunk_size: usize, word_index: u64) -> Result<Position> {
        let bounds = self.boundaries;
        let from = from.clamp(bounds.start_byte, bounds.end_byte);
        let stop = bounds.end_byte;
        if from >= stop {
            return Ok(self.position(from, chunk_size, word_index, Vec::new(), None, true));
        }

        let mut window =
            ((self.expected_bytes(chunk_size) as f64 * self.overfetch_factor).ceil() as u64)
                .max(MIN_WINDOW);
        loop {
            let fetch_start = from.saturating_sub(self.utf8_margin).max(bounds.start_byte);
            let fetch_end = from
                .saturating_add(window)
                .saturating_add(self.utf8_margin)
                .min(bounds.end_byte);
            let bytes = self.source.fetch_range(fetch_start, fetch_end - 1).await?;
            let reached = fetch_start + bytes.len() as u64;
            let is_final = reached >= bounds.end_byte;

            let extracted = extract_words(
                Window {
                    bytes: &bytes,
                    offset: fetch_start,
                    text_start: bounds.start_byte,
                    stop,
                    is_final,
                },
                from,
                chunk_size,
            );

            let exhausted = is_final || reached < fetch_end;
            if extracted.stop != Stop::NeedMore || exhausted {
                debug!(
                    resource = %self.resource,
                    from,
                    fetched = bytes.len(),
                    words = extracted.words.len(),
                    "chunk materialized"
                );
                let at_end = extracted.at_text_end;
                if let Some(last) = extracted.last_word_end {
                    let mut stats = self.word_stats.lock();
                    stats.bytes += last + 1 - from;
                    stats.words += extracted.words.len() as u64;
                }
                let position = self.position(
                    from,
                    chunk_size,
                    word_index,
                    extracted.words,
                    extracted.last_word_end,
                    at_end,
                );
                return Ok(position);
            }

            trace!(resource = %self.resource, from, window, "window too small, growing");
            window = window.saturating_mul(2);
        }
    }

    fn position(
        &self,
        from: u64,
        chunk_size: usize,
        word_index: u64,
        words: Vec<String>,
        last_word_end: Option<u64>,
        at_end: bool,
    ) -> Position {
        let byte_end = last_word_end.unwrap_or(from);
        let next_byte_start = if at_end || words.is_empty() {
            None
        } else {
            Some(byte_end + 1)
        };
        let is_near_end = match next_byte_start {
            None => true,
            Some(next) => {
                self.boundaries.end_byte.saturating_sub(next) < self.expected_bytes(chunk_size)
            }
        };
        Position {
            word_index,
            actual_count: words.len(),
            words,
            byte_start: from,
            byte_end,
            next_byte_start,
            percent: self.boundaries.percent_at(from),
            is_near_end,
        }
    }
}
