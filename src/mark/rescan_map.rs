//! Sparse rescan map: records which bitmap-word intervals received grey
//! marks when the marking stack was flushed, so overflow recovery can
//! revisit only those intervals instead of linearly rescanning
//! everything left of the finger.

/// Bitmap words per recorded interval. Coarse enough to keep the map
/// tiny, fine enough that draining an interval is cheap.
const LOG_WORDS_PER_INTERVAL: usize = 4;
pub const WORDS_PER_INTERVAL: usize = 1 << LOG_WORDS_PER_INTERVAL;

pub struct RescanMap {
    /// One flag per bitmap-word interval.
    recorded: Vec<bool>,
    /// Smallest recorded interval, tracked so recovery can drain in
    /// increasing address order without scanning the whole map.
    leftmost: usize,
    num_recorded: usize,
}

impl RescanMap {
    pub fn new(num_bitmap_words: usize) -> Self {
        let intervals = (num_bitmap_words + WORDS_PER_INTERVAL - 1) / WORDS_PER_INTERVAL;
        Self {
            recorded: vec![false; intervals],
            leftmost: usize::MAX,
            num_recorded: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_recorded == 0
    }

    /// Record the interval holding `bitmap_word`.
    pub fn record_word(&mut self, bitmap_word: usize) {
        let interval = bitmap_word >> LOG_WORDS_PER_INTERVAL;
        if !self.recorded[interval] {
            self.recorded[interval] = true;
            self.num_recorded += 1;
            if interval < self.leftmost {
                self.leftmost = interval;
            }
        }
    }

    /// Record a flushed cell, given the bitmap word of its mark.
    pub fn record_cell(&mut self, bitmap_word_of_cell: usize) {
        self.record_word(bitmap_word_of_cell);
    }

    /// Take the lowest recorded interval as a `[from_word, to_word)`
    /// bitmap-word range. Intervals recorded below an already-drained
    /// point re-register and are picked up by the next call.
    pub fn take_next_range(&mut self) -> Option<(usize, usize)> {
        if self.num_recorded == 0 {
            return None;
        }
        let mut interval = self.leftmost;
        if interval == usize::MAX || !self.recorded.get(interval).copied().unwrap_or(false) {
            interval = self.recorded.iter().position(|r| *r)?;
        }
        self.recorded[interval] = false;
        self.num_recorded -= 1;
        // Next leftmost is discovered lazily.
        self.leftmost = usize::MAX;
        Some((
            interval << LOG_WORDS_PER_INTERVAL,
            (interval + 1) << LOG_WORDS_PER_INTERVAL,
        ))
    }

    pub fn reset(&mut self) {
        self.recorded.fill(false);
        self.leftmost = usize::MAX;
        self.num_recorded = 0;
    }

    /// Diagnostic rendering of recorded intervals.
    pub fn recorded_intervals(&self) -> impl Iterator<Item = usize> + '_ {
        self.recorded
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.then_some(i))
    }
}
