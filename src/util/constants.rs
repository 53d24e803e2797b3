//! Word and page geometry shared by the whole crate.

/// log2 of the number of bytes in a heap word.
pub const LOG_BYTES_IN_WORD: usize = 3;
/// Bytes in a heap word.
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a heap word.
pub const LOG_BITS_IN_WORD: usize = LOG_BYTES_IN_WORD + LOG_BITS_IN_BYTE;
/// Bits in a heap word.
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bits in a byte.
pub const LOG_BITS_IN_BYTE: usize = 3;

/// log2 of the platform page size.
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// Bytes in a platform page.
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the card size. One card-table byte tracks this many heap bytes.
pub const LOG_BYTES_IN_CARD: usize = 9;
/// Bytes in a card.
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;
/// Words in a card.
pub const WORDS_IN_CARD: usize = BYTES_IN_CARD >> LOG_BYTES_IN_WORD;

/// Smallest formattable cell: one tagged size word plus one link word.
pub const MIN_CELL_SIZE: usize = 2 * BYTES_IN_WORD;
