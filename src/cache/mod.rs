//! Disk-backed sparse byte-range cache.
//!
//! A resource is cached as three files under the cache directory:
//!
//! - `<id>.txt`: data file pre-sized to the resource length
//! - `<id>.bitmap`: one bit per block, the only record of which bytes are valid
//! - `<id>.meta.json`: size, validators and timestamps ([`CacheMeta`])

mod bitmap;
mod meta;
mod sparse;

pub use bitmap::{
    bitmap_len, block_count, coalesce_ranges, count_cached_blocks, find_uncached_block_ranges,
    is_block_cached, mark_block_cached, mark_block_range_cached,
};
pub use meta::{CacheMeta, CachePaths};
pub use sparse::{BookCacheStats, CacheStats, RangeRead, SparseCache};
