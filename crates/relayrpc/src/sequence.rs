//! # Frame Reordering
//!
//! Frames for one invocation may arrive in any order, since every message
//! travels on its own connection. `Reorder` holds early frames until the gap
//! before them fills and releases messages strictly by `seq`.
//!
//! Delivery is at most once, so a gap may never fill. Two things keep a lost
//! frame from holding the rest back forever:
//!
//! - The buffer is bounded. When it overflows, the oldest gap is skipped.
//! - Once the terminal frame is known, `flush` releases everything buffered in
//!   order and gives up on the gaps.

use std::collections::BTreeMap;

use crate::message::ClientBound;
use crate::message::ClientFrame;

/// Frames held back at most before the oldest gap is skipped.
pub const DEFAULT_MAX_BUFFERED: usize = 1024;

#[derive(Debug)]
pub struct Reorder {
    next: u64,
    pending: BTreeMap<u64, ClientBound>,
    terminal: Option<u64>,
    max_buffered: usize,
    skipped: u64,
}

impl Default for Reorder {
    fn default() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }
}

impl Reorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            terminal: None,
            max_buffered: max_buffered.max(1),
            skipped: 0,
        }
    }

    /// Accepts one frame and returns every message now deliverable, in order.
    ///
    /// Frames below the release point, repeats of a buffered `seq`, and
    /// frames past the terminal one are dropped.
    pub fn push(&mut self, frame: ClientFrame) -> Vec<ClientBound> {
        if frame.seq < self.next || self.terminal.is_some_and(|end| frame.seq > end) {
            return Vec::new();
        }
        if frame.message.is_terminal() {
            let end = frame.seq;
            self.terminal = Some(end);
            self.pending.retain(|&seq, _| seq <= end);
        }
        self.pending.entry(frame.seq).or_insert(frame.message);

        let mut ready = self.release();
        while self.pending.len() > self.max_buffered {
            self.skip_gap();
            ready.extend(self.release());
        }
        ready
    }

    /// Releases everything buffered in `seq` order, skipping the gaps.
    pub fn flush(&mut self) -> Vec<ClientBound> {
        let mut ready = Vec::with_capacity(self.pending.len());
        while !self.pending.is_empty() {
            self.skip_gap();
            ready.extend(self.release());
        }
        ready
    }

    /// True when the terminal frame arrived but waits behind a gap.
    pub fn terminal_waiting(&self) -> bool {
        self.terminal.is_some_and(|end| end >= self.next)
    }

    /// Sequence number of the next message to be released.
    pub fn next_seq(&self) -> u64 {
        self.next
    }

    /// Number of frames waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Number of sequence numbers given up on.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn release(&mut self) -> Vec<ClientBound> {
        let mut ready = Vec::new();
        while let Some(message) = self.pending.remove(&self.next) {
            ready.push(message);
            self.next += 1;
        }
        ready
    }

    fn skip_gap(&mut self) {
        if let Some((&first, _)) = self.pending.first_key_value() {
            self.skipped += first - self.next;
            self.next = first;
        }
    }
}
