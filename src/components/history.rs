use crate::canvas::TiledImage;

// ============================================================================
// HISTORY ENTRY
// ============================================================================

/// One immutable full-surface snapshot.
///
/// The pixels are a copy-on-write clone of the surface at commit time, so
/// entries share untouched tiles with each other and with the live surface.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    description: String,
    pixels: TiledImage,
}

impl HistoryEntry {
    pub fn new(description: impl Into<String>, pixels: TiledImage) -> Self {
        Self {
            description: description.into(),
            pixels,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pixels(&self) -> &TiledImage {
        &self.pixels
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.memory_bytes() + self.description.len()
    }
}

// ============================================================================
// HISTORY STACK - linear undo/redo over full snapshots, with memory limits
// ============================================================================

/// Linear snapshot history.  Always holds at least one entry, and `index`
/// always points at a valid entry.
pub struct HistoryStack {
    entries: Vec<HistoryEntry>,
    index: usize,
    max_entries: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
}

impl HistoryStack {
    pub const DEFAULT_MAX_ENTRIES: usize = 50;
    pub const DEFAULT_MAX_MEMORY_BYTES: usize = 100 * 1024 * 1024;

    /// Start a history whose only entry is `initial`.
    pub fn new(initial: HistoryEntry) -> Self {
        Self::with_limits(initial, Self::DEFAULT_MAX_ENTRIES, Some(Self::DEFAULT_MAX_MEMORY_BYTES))
    }

    /// `max_entries` is clamped to at least 1.
    pub fn with_limits(initial: HistoryEntry, max_entries: usize, max_memory_bytes: Option<usize>) -> Self {
        Self {
            entries: vec![initial],
            index: 0,
            max_entries: max_entries.max(1),
            max_memory_bytes,
        }
    }

    /// Record a new state.  Anything redo-able is discarded first.
    pub fn commit(&mut self, entry: HistoryEntry) {
        let discarded = self.entries.len() - 1 - self.index;
        if discarded > 0 {
            log::debug!("history: discarding {} redo entries", discarded);
        }
        self.entries.truncate(self.index + 1);
        self.entries.push(entry);
        self.index = self.entries.len() - 1;

        self.prune();
    }

    /// Step back.  `None` when already at the oldest entry.
    pub fn undo(&mut self) -> Option<&HistoryEntry> {
        if !self.can_undo() {
            return None;
        }
        self.index -= 1;
        Some(&self.entries[self.index])
    }

    /// Step forward.  `None` when already at the newest entry.
    pub fn redo(&mut self) -> Option<&HistoryEntry> {
        if !self.can_redo() {
            return None;
        }
        self.index += 1;
        Some(&self.entries[self.index])
    }

    /// Jump straight to `index` (clamped to the last entry), as a history
    /// panel click does.  Returns the entry now current.
    pub fn jump_to(&mut self, index: usize) -> &HistoryEntry {
        self.index = index.min(self.entries.len() - 1);
        &self.entries[self.index]
    }

    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.index + 1 < self.entries.len()
    }

    pub fn current(&self) -> &HistoryEntry {
        &self.entries[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Never true; kept for the usual `len`/`is_empty` pairing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All descriptions, oldest first.
    pub fn descriptions(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.description()).collect()
    }

    /// Approximate memory held by all entries.
    pub fn memory_usage(&self) -> usize {
        self.entries.iter().map(|e| e.memory_size()).sum()
    }

    /// Drop the oldest entries to stay within limits.  The current entry is
    /// never dropped, so `index` stays valid and the stack never empties.
    fn prune(&mut self) {
        let mut dropped = 0;

        // Prune by count
        while self.entries.len() > self.max_entries && self.index > 0 {
            self.entries.remove(0);
            self.index -= 1;
            dropped += 1;
        }

        // Prune by memory if limit is set
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.index > 0 && self.memory_usage() > max_bytes {
                self.entries.remove(0);
                self.index -= 1;
                dropped += 1;
            }
        }

        if dropped > 0 {
            log::debug!(
                "history: pruned {} oldest entries ({} kept, ~{} KB)",
                dropped,
                self.entries.len(),
                self.memory_usage() / 1024
            );
        }
    }
}
