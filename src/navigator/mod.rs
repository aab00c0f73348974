//! Word-chunk navigation over a [`ByteSource`](crate::io::ByteSource).
//!
//! - [`Boundaries`]: the readable span of the resource
//! - [`Position`]: one chunk of words with its exact byte span
//! - [`Navigator`]: percent jumps, forward/backward moves and chunk-size changes

mod history;
mod loader;
mod pager;
mod position;
mod words;

pub use history::{HistoryEntry, PositionHistory};
pub use pager::Navigator;
pub use position::{Boundaries, Position};
pub use words::{Extracted, Stop, Window, extract_last_words, extract_words, utf8_complete_len};
