use std::collections::VecDeque;

/// A remembered hop between two chunk starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Chunk start to return to
    pub target: u64,
    /// Chunk start this entry is valid from
    pub origin: u64,
    pub word_index: u64,
}

/// Back and forward stacks of exact chunk offsets.
///
/// An entry is only used when the reader is at its `origin`, which keeps a
/// forward-then-backward walk byte exact without trusting stale entries.
#[derive(Debug, Clone)]
pub struct PositionHistory {
    back: VecDeque<HistoryEntry>,
    forward: Vec<HistoryEntry>,
    cap: usize,
}

impl PositionHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            back: VecDeque::new(),
            forward: Vec::new(),
            cap: cap.max(1),
        }
    }

    pub fn push_back(&mut self, entry: HistoryEntry) {
        if self.back.len() == self.cap {
            self.back.pop_front();
        }
        self.back.push_back(entry);
    }

    pub fn push_forward(&mut self, entry: HistoryEntry) {
        if self.forward.len() == self.cap {
            self.forward.remove(0);
        }
        self.forward.push(entry);
    }

    /// The newest back entry, if it starts at `origin`
    pub fn peek_back(&self, origin: u64) -> Option<HistoryEntry> {
        self.back.back().copied().filter(|e| e.origin == origin)
    }

    /// The newest forward entry, if it starts at `origin`
    pub fn peek_forward(&self, origin: u64) -> Option<HistoryEntry> {
        self.forward.last().copied().filter(|e| e.origin == origin)
    }

    pub fn pop_back(&mut self) -> Option<HistoryEntry> {
        self.back.pop_back()
    }

    pub fn pop_forward(&mut self) -> Option<HistoryEntry> {
        self.forward.pop()
    }

    pub fn clear_forward(&mut self) {
        self.forward.clear();
    }

    pub fn clear(&mut self) {
        self.back.clear();
        self.forward.clear();
    }

    /// `(back, forward)` stack depths
    pub fn depth(&self) -> (usize, usize) {
        (self.back.len(), self.forward.len())
    }
}
