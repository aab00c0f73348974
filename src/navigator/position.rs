use serde::Serialize;

/// The byte span of a resource that holds readable text.
///
/// `end_byte` is exclusive. Computed by the caller (e.g. after stripping a
/// license header) and read-only for a navigation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Boundaries {
    pub start_byte: u64,
    pub end_byte: u64,
    pub clean_length: u64,
}

impl Boundaries {
    pub fn new(start_byte: u64, end_byte: u64) -> Self {
        let end_byte = end_byte.max(start_byte);
        Self {
            start_byte,
            end_byte,
            clean_length: end_byte - start_byte,
        }
    }

    /// The whole resource
    pub fn whole(size: u64) -> Self {
        Self::new(0, size)
    }

    pub fn is_empty(&self) -> bool {
        self.end_byte <= self.start_byte
    }

    /// Byte offset `percent` of the way through the text, clamped inside it
    pub fn offset_at(&self, percent: f64) -> u64 {
        if self.is_empty() {
            return self.start_byte;
        }
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        let len = self.end_byte - self.start_byte;
        let offset = (len as f64 * percent / 100.0).floor() as u64;
        self.start_byte + offset.min(len - 1)
    }

    /// How far `byte` is through the text, 0 to 100
    pub fn percent_at(&self, byte: u64) -> f64 {
        let len = if self.clean_length > 0 {
            self.clean_length
        } else {
            self.end_byte - self.start_byte
        };
        if len == 0 {
            return 100.0;
        }
        let done = byte.saturating_sub(self.start_byte) as f64;
        (done * 100.0 / len as f64).clamp(0.0, 100.0)
    }
}

/// One materialized chunk of words.
///
/// `byte_start..=byte_end` is the exact span the chunk consumed. The next
/// chunk starts at `byte_end + 1`, so consecutive chunks tile the text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub word_index: u64,
    pub words: Vec<String>,
    pub actual_count: usize,
    pub byte_start: u64,
    pub byte_end: u64,
    /// `None` once the chunk reaches the end of the text
    pub next_byte_start: Option<u64>,
    pub percent: f64,
    pub is_near_end: bool,
}

impl Position {
    pub fn text(&self) -> String {
        self.words.join(" ")
    }
}
