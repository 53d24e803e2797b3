//! The tricolor mark bitmap. Three colors are encoded in two
//! consecutive bits per covered granule while consuming no more space
//! than a single-bit map: every cell is at least two words long, so
//! every cell owns at least two bits and the pattern `11` can only ever
//! be one cell's color.
//!
//! Encoding (bit `b` is the cell's bit index, `b+1` the bit above it):
//! - WHITE = `00`, BLACK = `01`, GREY = `11`; `10` never occurs.
//! - A word holds a grey mark iff `w & (w >> 1)` is non-zero, and the
//!   lowest set bit of that value is the first grey cell — the probe
//!   the scan loops are built around.
//! - A color may straddle two bitmap words when `b` is the last bit of
//!   a word; the plain paths handle the straddle, the `_unchecked`
//!   paths assume it away and assert so in debug builds.

use crate::util::constants::{BITS_IN_WORD, LOG_BITS_IN_WORD, LOG_BYTES_IN_WORD};
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};

const LAST_BIT_IN_WORD: usize = BITS_IN_WORD - 1;

pub struct ColorMap {
    /// One guard word beyond the covered bits lets straddling marks and
    /// scan loops run off the end without bounds juggling.
    words: Box<[AtomicUsize]>,
    covered_start: Address,
    covered_end: Address,
    log2_bytes_per_bit: usize,
}

impl ColorMap {
    /// Create an all-white map covering `[start, start + bytes)`, one
    /// bit per word-sized granule.
    pub fn new(covered_start: Address, covered_bytes: usize) -> Self {
        let log2_bytes_per_bit = LOG_BYTES_IN_WORD;
        let bits = covered_bytes >> log2_bytes_per_bit;
        let words = (bits + BITS_IN_WORD - 1) / BITS_IN_WORD + 1;
        Self {
            words: (0..words).map(|_| AtomicUsize::new(0)).collect(),
            covered_start,
            covered_end: covered_start + covered_bytes,
            log2_bytes_per_bit,
        }
    }

    pub fn covered_start(&self) -> Address {
        self.covered_start
    }

    pub fn covered_end(&self) -> Address {
        self.covered_end
    }

    pub fn is_covered(&self, addr: Address) -> bool {
        addr >= self.covered_start && addr < self.covered_end
    }

    /// Turn every mark white again.
    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    // Bit geometry.

    pub fn bit_index_of(&self, cell: Address) -> usize {
        debug_assert!(self.is_covered(cell), "cell {cell} not covered");
        (cell - self.covered_start) >> self.log2_bytes_per_bit
    }

    pub fn address_of(&self, bit: usize) -> Address {
        self.covered_start + (bit << self.log2_bytes_per_bit)
    }

    pub fn word_index(&self, bit: usize) -> usize {
        bit >> LOG_BITS_IN_WORD
    }

    /// Bitmap word index covering `addr`.
    pub fn word_index_of(&self, addr: Address) -> usize {
        self.word_index(self.bit_index_of(addr))
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    fn word(&self, index: usize) -> usize {
        self.words[index].load(Ordering::Relaxed)
    }

    fn bit_in_word(bit: usize) -> usize {
        bit & LAST_BIT_IN_WORD
    }

    fn straddles_words(bit: usize) -> bool {
        Self::bit_in_word(bit) == LAST_BIT_IN_WORD
    }

    // Color updates. All plain (stop-the-world) unless marked atomic.

    /// Set the mark at `bit` grey.
    pub fn mark_grey(&self, bit: usize) {
        if Self::straddles_words(bit) {
            let wi = self.word_index(bit);
            self.or_word(wi, 1 << LAST_BIT_IN_WORD);
            self.or_word(wi + 1, 1);
        } else {
            self.or_word(self.word_index(bit), 0b11 << Self::bit_in_word(bit));
        }
    }

    /// Grey the mark, assuming it does not straddle words.
    pub fn mark_grey_unchecked(&self, bit: usize) {
        debug_assert!(!Self::straddles_words(bit), "color must not cross word boundary");
        self.or_word(self.word_index(bit), 0b11 << Self::bit_in_word(bit));
    }

    /// Grey a white mark; no-op on grey or black. Returns whether the
    /// mark was white. Plain read-modify-write: only for phases with a
    /// single marking thread.
    pub fn mark_grey_if_white(&self, bit: usize) -> bool {
        if !self.is_white(bit) {
            return false;
        }
        self.mark_grey(bit);
        true
    }

    /// Atomic variant of [`ColorMap::mark_grey_if_white`] for the
    /// phases where mutator threads grey concurrently. Exactly one
    /// caller wins the white-to-grey transition.
    pub fn mark_grey_if_white_atomic(&self, bit: usize) -> bool {
        let wi = self.word_index(bit);
        let base_mask = 1usize << Self::bit_in_word(bit);
        // Claim the base bit first: whoever flips it owns the color.
        let prev = self.words[wi].fetch_or(base_mask, Ordering::SeqCst);
        if prev & base_mask != 0 {
            return false;
        }
        if Self::straddles_words(bit) {
            self.words[wi + 1].fetch_or(1, Ordering::SeqCst);
        } else {
            self.words[wi].fetch_or(base_mask << 1, Ordering::SeqCst);
        }
        true
    }

    /// Blacken a grey mark by clearing its grey bit. The grey bit of
    /// `bit` is bit `bit + 1`, which never needs straddle handling
    /// beyond indexing into the following word.
    pub fn mark_black_from_grey(&self, bit: usize) {
        let grey_bit = bit + 1;
        let wi = self.word_index(grey_bit);
        self.and_word(wi, !(1usize << Self::bit_in_word(grey_bit)));
    }

    /// Blacken a white mark directly (forward-scan shortcut for cells
    /// past the finger). Returns whether the mark was white.
    pub fn mark_black_if_white(&self, bit: usize) -> bool {
        if !self.is_white(bit) {
            return false;
        }
        self.or_word(self.word_index(bit), 1usize << Self::bit_in_word(bit));
        true
    }

    // Color tests.

    /// White test: only the base bit matters, so a straddling color
    /// needs no special care.
    pub fn is_white(&self, bit: usize) -> bool {
        self.word(self.word_index(bit)) & (1usize << Self::bit_in_word(bit)) == 0
    }

    pub fn is_grey(&self, bit: usize) -> bool {
        let grey_bit = bit + 1;
        self.word(self.word_index(grey_bit)) & (1usize << Self::bit_in_word(grey_bit)) != 0
    }

    /// Black test valid whenever the mark is known not white.
    pub fn is_black_when_not_white(&self, bit: usize) -> bool {
        if self.is_grey(bit) {
            return false;
        }
        debug_assert!(!self.is_white(bit), "mark at bit {bit} is white");
        true
    }

    pub fn is_black(&self, bit: usize) -> bool {
        !self.is_white(bit) && !self.is_grey(bit)
    }

    // Scans.

    fn or_word(&self, index: usize, mask: usize) {
        let w = self.words[index].load(Ordering::Relaxed);
        self.words[index].store(w | mask, Ordering::Relaxed);
    }

    fn and_word(&self, index: usize, mask: usize) {
        let w = self.words[index].load(Ordering::Relaxed);
        self.words[index].store(w & mask, Ordering::Relaxed);
    }

    /// Bit index of the first grey mark in word range
    /// `[from_word, to_word]`, or None. `limit_bit` upper-bounds the
    /// result (exclusive).
    pub fn first_grey_in_words(
        &self,
        from_word: usize,
        to_word: usize,
        limit_bit: usize,
    ) -> Option<usize> {
        let mut wi = from_word;
        while wi <= to_word && wi < self.words.len() {
            let w = self.word(wi);
            if w != 0 {
                let greys = w & (w >> 1);
                if greys != 0 {
                    let bit = (wi << LOG_BITS_IN_WORD) + greys.trailing_zeros() as usize;
                    return (bit < limit_bit).then_some(bit);
                }
                // A mark in the last bit may be a grey straddling into
                // the next word.
                if w >> LAST_BIT_IN_WORD == 1 && self.word(wi + 1) & 1 != 0 {
                    let bit = (wi << LOG_BITS_IN_WORD) + LAST_BIT_IN_WORD;
                    return (bit < limit_bit).then_some(bit);
                }
            }
            wi += 1;
        }
        None
    }

    /// Bit index of the first non-white mark in `[from_bit, to_bit)`,
    /// or None. At sweep time all marks are black, so any set base bit
    /// is a live cell.
    pub fn first_black_mark(&self, from_bit: usize, to_bit: usize) -> Option<usize> {
        let mut wi = self.word_index(from_bit);
        let to_word = self.word_index(to_bit.saturating_sub(1));
        // Ignore bits below from_bit in the first word.
        let mut mask = !0usize << Self::bit_in_word(from_bit);
        while wi <= to_word && wi < self.words.len() {
            let w = self.word(wi) & mask;
            mask = !0;
            if w != 0 {
                let bit = (wi << LOG_BITS_IN_WORD) + w.trailing_zeros() as usize;
                return (bit < to_bit).then_some(bit);
            }
            wi += 1;
        }
        None
    }

    /// Check that `[start, end)` holds no grey mark; fatal otherwise.
    pub fn verify_no_grey(&self, start: Address, end: Address) {
        let from_word = self.word_index_of(start);
        let limit_bit = self.bit_index_of(end - 1usize) + 1;
        let to_word = self.word_index(limit_bit - 1);
        if let Some(bit) = self.first_grey_in_words(from_word, to_word, limit_bit) {
            crate::fatal_error!(
                "grey mark found for cell {} in grey-free area [{}, {})",
                self.address_of(bit),
                start,
                end
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> ColorMap {
        let base = unsafe { Address::from_usize(0x100_0000) };
        // 4096 bytes covered -> 512 bits.
        ColorMap::new(base, 4096)
    }

    #[test]
    fn color_lifecycle() {
        let m = map();
        let cell = m.covered_start() + 64usize;
        let bit = m.bit_index_of(cell);
        assert!(m.is_white(bit));
        assert!(m.mark_grey_if_white(bit));
        assert!(!m.mark_grey_if_white(bit));
        assert!(m.is_grey(bit));
        assert!(!m.is_black(bit));
        m.mark_black_from_grey(bit);
        assert!(m.is_black(bit));
        assert!(m.is_black_when_not_white(bit));
        m.clear();
        assert!(m.is_white(bit));
    }

    #[test]
    fn straddling_grey_is_found() {
        let m = map();
        let bit = BITS_IN_WORD - 1; // last bit of word 0
        m.mark_grey(bit);
        assert!(m.is_grey(bit));
        assert_eq!(m.first_grey_in_words(0, 4, usize::MAX), Some(bit));
        m.mark_black_from_grey(bit);
        assert!(m.is_black(bit));
        assert_eq!(m.first_grey_in_words(0, 4, usize::MAX), None);
    }

    #[test]
    fn adjacent_black_marks_are_not_grey() {
        let m = map();
        // Two minimum-size cells two bits apart, both black.
        assert!(m.mark_black_if_white(8));
        assert!(m.mark_black_if_white(10));
        assert_eq!(m.first_grey_in_words(0, 4, usize::MAX), None);
        assert_eq!(m.first_black_mark(0, 512), Some(8));
        assert_eq!(m.first_black_mark(9, 512), Some(10));
        assert_eq!(m.first_black_mark(11, 512), None);
    }

    #[test]
    fn atomic_grey_single_winner() {
        let m = map();
        assert!(m.mark_grey_if_white_atomic(20));
        assert!(!m.mark_grey_if_white_atomic(20));
        assert!(m.is_grey(20));
    }

    #[test]
    #[cfg(debug_assertions)]
    fn verify_no_grey_is_fatal_on_grey() {
        let m = map();
        m.mark_grey(12);
        let start = m.covered_start();
        let end = m.covered_end();
        assert!(std::panic::catch_unwind(move || m.verify_no_grey(start, end)).is_err());
    }
}
