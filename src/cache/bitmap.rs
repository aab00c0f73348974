//! Block presence bitmap.
//!
//! One bit per block, least significant bit first within each byte. These
//! are plain functions over a byte slice so the cache can keep the bitmap in
//! memory and persist it verbatim.

/// Number of blocks covering `file_size` bytes
pub fn block_count(file_size: u64, block_size: u64) -> u64 {
    file_size.div_ceil(block_size)
}

/// Bitmap length in bytes for a file of `file_size` bytes
pub fn bitmap_len(file_size: u64, block_size: u64) -> usize {
    block_count(file_size, block_size).div_ceil(8) as usize
}

pub fn is_block_cached(bitmap: &[u8], block: u64) -> bool {
    bitmap
        .get((block / 8) as usize)
        .is_some_and(|byte| byte & (1 << (block % 8)) != 0)
}

/// Set the bit for `block`. Blocks past the end of the bitmap are ignored.
pub fn mark_block_cached(bitmap: &mut [u8], block: u64) {
    if let Some(byte) = bitmap.get_mut((block / 8) as usize) {
        *byte |= 1 << (block % 8);
    }
}

/// Set the bits for blocks `first..=last`
pub fn mark_block_range_cached(bitmap: &mut [u8], first: u64, last: u64) {
    for block in first..=last {
        mark_block_cached(bitmap, block);
    }
}

/// Count set bits among the first `total_blocks` blocks
pub fn count_cached_blocks(bitmap: &[u8], total_blocks: u64) -> u64 {
    let full_bytes = (total_blocks / 8) as usize;
    let mut count: u64 = bitmap
        .iter()
        .take(full_bytes)
        .map(|b| u64::from(b.count_ones()))
        .sum();
    for block in (full_bytes as u64 * 8)..total_blocks {
        if is_block_cached(bitmap, block) {
            count += 1;
        }
    }
    count
}

/// Byte ranges (inclusive, block aligned, clamped to the file) of the blocks
/// covering `start..=end` that are not cached.
///
/// Adjacent uncached blocks form a single range; cached blocks split ranges.
pub fn find_uncached_block_ranges(
    bitmap: &[u8],
    start: u64,
    end: u64,
    block_size: u64,
    file_size: u64,
) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    if file_size == 0 || start >= file_size || start > end {
        return ranges;
    }
    let end = end.min(file_size - 1);
    let first = start / block_size;
    let last = end / block_size;

    let mut run_start: Option<u64> = None;
    for block in first..=last {
        match (is_block_cached(bitmap, block), run_start) {
            (false, None) => run_start = Some(block),
            (true, Some(run)) => {
                ranges.push(block_span(run, block - 1, block_size, file_size));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(run) = run_start {
        ranges.push(block_span(run, last, block_size, file_size));
    }
    ranges
}

/// Inclusive byte span of blocks `first..=last`, clamped to the file
pub fn block_span(first: u64, last: u64, block_size: u64, file_size: u64) -> (u64, u64) {
    let end = (last + 1) * block_size - 1;
    (first * block_size, end.min(file_size.saturating_sub(1)))
}

/// Merge sorted ranges whose gap is at most `max_gap` bytes.
///
/// The merged range re-fetches the gap, trading a few bytes for one fewer
/// upstream request.
pub fn coalesce_ranges(ranges: &[(u64, u64)], max_gap: u64) -> Vec<(u64, u64)> {
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start.saturating_sub(last.1 + 1) <= max_gap => {
                last.1 = last.1.max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}
