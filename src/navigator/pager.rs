use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use super::history::{HistoryEntry, PositionHistory};
use super::loader::ChunkLoader;
use super::position::{Boundaries, Position};
use crate::config::NavigatorConfig;
use crate::io::ByteSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Pages through a text in chunks of a fixed number of words.
///
/// Moving forward and then back the same number of steps returns exactly the
/// same bytes and words. Any failed move leaves the current position, the
/// history and the chunk cache as they were.
pub struct Navigator<S: ?Sized> {
    loader: ChunkLoader<S>,
    boundaries: Boundaries,
    chunk_size: usize,
    history: PositionHistory,
    current: Option<Position>,
    config: NavigatorConfig,
}

impl<S: ByteSource + ?Sized + 'static> Navigator<S> {
    /// `resource` only names the source in the chunk cache and logs
    pub fn new(
        source: Arc<S>,
        resource: impl Into<String>,
        boundaries: Boundaries,
        config: NavigatorConfig,
    ) -> Self {
        let loader = ChunkLoader::new(source, resource.into(), boundaries, &config);
        Self {
            loader,
            boundaries,
            chunk_size: config.chunk_size.max(1),
            history: PositionHistory::new(config.history_cap),
            current: None,
            config,
        }
    }

    /// Navigator over a whole source
    pub async fn for_source(
        source: Arc<S>,
        resource: impl Into<String>,
        config: NavigatorConfig,
    ) -> Result<Self> {
        let size = source.size().await?;
        Ok(Self::new(source, resource, Boundaries::whole(size), config))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn current(&self) -> Option<&Position> {
        self.current.as_ref()
    }

    /// `(back, forward)` history depths
    pub fn history_depth(&self) -> (usize, usize) {
        self.history.depth()
    }

    pub fn cached_chunks(&self) -> usize {
        self.loader.cached_chunks()
    }

    /// Jump to a percentage of the text. History is discarded.
    pub async fn go_to_percent(&mut self, percent: f64) -> Result<Position> {
        let target = self.boundaries.offset_at(percent);
        self.go_to_byte(target).await
    }

    /// Jump to the first word at or after `byte`. History is discarded.
    ///
    /// If nothing but whitespace follows `byte`, earlier offsets are tried.
    pub async fn go_to_byte(&mut self, byte: u64) -> Result<Position> {
        let start = self.boundaries.start_byte;
        let mut target = byte.clamp(start, self.boundaries.end_byte);
        let step = self.loader.expected_bytes(self.chunk_size);

        let position = loop {
            let position = self
                .loader
                .load(target, self.chunk_size, self.word_index_at(target))
                .await?;
            if !position.words.is_empty() || target == start {
                break position;
            }
            target = target.saturating_sub(step).max(start);
        };

        debug!(byte_start = position.byte_start, percent = position.percent, "jumped");
        self.history.clear();
        self.current = Some(position.clone());
        self.prefetch(&position, Direction::Forward);
        Ok(position)
    }

    /// The chunk after the current one, or `None` at the end of the text
    pub async fn move_forward(&mut self) -> Result<Option<Position>> {
        let Some(current) = self.current.clone() else {
            return Ok(None);
        };

        let redo = self.history.peek_forward(current.byte_start);
        let (target, word_index) = match (redo, current.next_byte_start) {
            (Some(entry), _) => (entry.target, entry.word_index),
            (None, Some(next)) => (next, current.word_index + current.actual_count as u64),
            (None, None) => return Ok(None),
        };
        if target >= self.boundaries.end_byte {
            return Ok(None);
        }

        let next = self.loader.load(target, self.chunk_size, word_index).await?;
        if next.words.is_empty() {
            return Ok(None);
        }

        if redo.is_some() {
            self.history.pop_forward();
        } else {
            self.history.clear_forward();
        }
        self.history.push_back(HistoryEntry {
            target: current.byte_start,
            origin: next.byte_start,
            word_index: current.word_index,
        });
        self.current = Some(next.clone());
        self.prefetch(&next, Direction::Forward);
        Ok(Some(next))
    }

    /// The chunk before the current one, or `None` when no earlier chunk can
    /// be placed reliably.
    ///
    /// Uses the exact offset from history when there is one. Otherwise the
    /// previous start is estimated from the bytes-per-word average and the
    /// estimate is kept only if it lands far enough before the current chunk.
    pub async fn move_backward(&mut self) -> Result<Option<Position>> {
        let Some(current) = self.current.clone() else {
            return Ok(None);
        };

        let exact = self.history.peek_back(current.byte_start);
        let previous = match exact {
            Some(entry) => {
                self.loader
                    .load(entry.target, self.chunk_size, entry.word_index)
                    .await?
            }
            None => match self.estimate_previous(&current).await? {
                Some(position) => position,
                None => return Ok(None),
            },
        };
        if previous.words.is_empty() {
            return Ok(None);
        }

        if exact.is_some() {
            self.history.pop_back();
        }
        self.history.push_forward(HistoryEntry {
            target: current.byte_start,
            origin: previous.byte_start,
            word_index: current.word_index,
        });
        self.current = Some(previous.clone());
        self.prefetch(&previous, Direction::Backward);
        Ok(Some(previous))
    }

    /// Change the words per chunk, staying at the same byte offset.
    ///
    /// History is discarded since offsets for different chunk sizes do not line up.
    pub async fn set_chunk_size(&mut self, chunk_size: usize) -> Result<Option<Position>> {
        let chunk_size = chunk_size.max(1);
        let Some(current) = self.current.clone() else {
            self.chunk_size = chunk_size;
            self.history.clear();
            return Ok(None);
        };

        let position = self
            .loader
            .load(current.byte_start, chunk_size, current.word_index)
            .await?;
        self.chunk_size = chunk_size;
        self.history.clear();
        self.current = Some(position.clone());
        self.prefetch(&position, Direction::Forward);
        Ok(Some(position))
    }

    /// The chunk that ends right before `current`, placed by looking back one
    /// overfetched chunk's worth of bytes.
    ///
    /// Kept only when it reaches at least half the expected chunk length back,
    /// unless the look-back already hit the start of the text.
    async fn estimate_previous(&self, current: &Position) -> Result<Option<Position>> {
        let start = self.boundaries.start_byte;
        if current.byte_start <= start {
            return Ok(None);
        }

        let expected = self.loader.expected_bytes(self.chunk_size);
        let window = (expected as f64 * self.config.overfetch_factor.max(1.0)).ceil() as u64;
        let clamped = current.byte_start.saturating_sub(window) <= start;
        let Some(position) = self
            .loader
            .load_ending_at(current.byte_start, self.chunk_size, window)
            .await?
        else {
            return Ok(None);
        };

        let distance = current.byte_start - position.byte_start;
        if !clamped && distance.saturating_mul(2) < expected {
            debug!(
                byte_start = current.byte_start,
                window, distance, "backward estimate too close, staying put"
            );
            return Ok(None);
        }

        let word_index = current
            .word_index
            .saturating_sub(position.actual_count as u64);
        Ok(Some(Position {
            word_index,
            ..position
        }))
    }

    fn word_index_at(&self, byte: u64) -> u64 {
        let offset = byte.saturating_sub(self.boundaries.start_byte);
        (offset as f64 / self.loader.bytes_per_word()).round() as u64
    }

    /// Warm the chunk cache around `position`: the next chunk in the direction
    /// of travel soon, the other side a little later.
    fn prefetch(&self, position: &Position, direction: Direction) {
        if !self.config.prefetch {
            return;
        }
        let ahead = Duration::from_millis(self.config.prefetch_ahead_ms);
        let behind = Duration::from_millis(self.config.prefetch_behind_ms);

        let next = position
            .next_byte_start
            .map(|next| (next, position.word_index + position.actual_count as u64));
        let previous = self
            .history
            .peek_back(position.byte_start)
            .map(|entry| (entry.target, entry.word_index));

        let (soon, later) = match direction {
            Direction::Forward => (next, previous),
            Direction::Backward => (previous, next),
        };
        if let Some((from, word_index)) = soon {
            self.loader.prefetch(from, self.chunk_size, word_index, ahead);
        }
        if let Some((from, word_index)) = later {
            self.loader.prefetch(from, self.chunk_size, word_index, behind);
        }
    }
}
