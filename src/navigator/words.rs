//! Word extraction from raw byte windows.
//!
//! Words are runs of non-whitespace bytes separated by ASCII whitespace.
//! UTF-8 continuation and lead bytes are never ASCII, so splitting on ASCII
//! whitespace cannot cut a codepoint in half. Only the window edges can,
//! and those are handled by skipping a partial leading word and refusing an
//! unterminated trailing word unless the window reaches the end of the text.

/// Why extraction stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Collected the requested number of words
    Full,
    /// Hit the end of the text or the caller's stop offset
    End,
    /// The window ran out first; fetch a larger one
    NeedMore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub words: Vec<String>,
    pub first_word_start: Option<u64>,
    /// Absolute offset of the last byte of the last word
    pub last_word_end: Option<u64>,
    pub stop: Stop,
    /// No further words exist after the extracted ones
    pub at_text_end: bool,
}

/// Input window for [`extract_words`]
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    pub bytes: &'a [u8],
    /// Absolute offset of `bytes[0]`
    pub offset: u64,
    /// First byte of the text; a word starting here is never partial
    pub text_start: u64,
    /// Words must end before this absolute offset
    pub stop: u64,
    /// The window reaches the end of the text
    pub is_final: bool,
}

pub fn is_word_separator(b: u8) -> bool {
    b.is_ascii_whitespace()
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence
pub fn utf8_complete_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match b {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}

/// Collect up to `count` complete words starting at the first word boundary at
/// or after absolute offset `from`.
pub fn extract_words(window: Window<'_>, from: u64, count: usize) -> Extracted {
    let bytes = window.bytes;
    let len = if window.is_final {
        bytes.len()
    } else {
        utf8_complete_len(bytes)
    };
    let mut i = from.saturating_sub(window.offset) as usize;

    // Skip the tail of a word that started before `from`
    if from > window.text_start
        && i > 0
        && i < len
        && !is_word_separator(bytes[i - 1])
        && !is_word_separator(bytes[i])
    {
        while i < len && !is_word_separator(bytes[i]) {
            i += 1;
        }
    }

    let mut words = Vec::new();
    let mut first_word_start = None;
    let mut last_word_end = None;
    let stop = loop {
        if count == 0 {
            break Stop::Full;
        }
        while i < len && is_word_separator(bytes[i]) {
            i += 1;
        }
        if window.offset + i as u64 >= window.stop {
            break Stop::End;
        }
        if i >= len {
            break if window.is_final { Stop::End } else { Stop::NeedMore };
        }

        let word_start = i;
        while i < len && !is_word_separator(bytes[i]) {
            i += 1;
        }
        if i >= len && !window.is_final {
            break Stop::NeedMore;
        }
        if window.offset + i as u64 > window.stop {
            break Stop::End;
        }

        words.push(String::from_utf8_lossy(&bytes[word_start..i]).into_owned());
        first_word_start.get_or_insert(window.offset + word_start as u64);
        last_word_end = Some(window.offset + i as u64 - 1);
        if words.len() == count {
            break Stop::Full;
        }
    };

    let at_text_end = match stop {
        Stop::End => true,
        Stop::NeedMore => false,
        Stop::Full => {
            let mut j = i;
            while j < len && is_word_separator(bytes[j]) {
                j += 1;
            }
            window.is_final && j >= len
        }
    };

    Extracted {
        words,
        first_word_start,
        last_word_end,
        stop,
        at_text_end,
    }
}

/// The last `count` complete words that end before `window.stop`, among
/// those at or after the first word boundary at or after `from`.
///
/// `first_word_start` is the start of the first word kept.
pub fn extract_last_words(window: Window<'_>, from: u64, count: usize) -> Extracted {
    let mut all = extract_words(window, from, usize::MAX);
    if count == 0 {
        all.words.clear();
        all.first_word_start = None;
        all.last_word_end = None;
        return all;
    }
    let (Some(last), true) = (all.last_word_end, all.words.len() > count) else {
        return all;
    };

    all.words.drain(..all.words.len() - count);
    let bytes = window.bytes;
    let mut i = (last + 1 - window.offset) as usize;
    for _ in 0..count {
        while i > 0 && is_word_separator(bytes[i - 1]) {
            i -= 1;
        }
        while i > 0 && !is_word_separator(bytes[i - 1]) {
            i -= 1;
        }
    }
    all.first_word_start = Some(window.offset + i as u64);
    all
}
