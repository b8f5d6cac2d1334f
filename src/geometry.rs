//! Chunk geometry.
//!
//! A page of [`PAGE_SIZE`] bytes is divided into [`TOTAL_CHUNKS`] chunks of
//! [`CHUNK_SIZE`] bytes each. The first [`HEADER_CHUNKS`] chunks are reserved
//! for the block header, leaving [`NCHUNKS`] chunks for at most [`BUDDIES`]
//! allocations. Allocation sizes are rounded up to a whole number of chunks.
//!
//! ```text
//! | header | FIRST | SECOND | THIRD |   free   | LAST |
//! 0        8                                        256
//! ```
//!
//! FIRST always begins right after the header and LAST always ends at the
//! page boundary. The middle buddies are placed directly after their nearest
//! occupied predecessor.

use crate::AllocError;

/// The size of a page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of the number of chunks in a page.
pub const NCHUNKS_ORDER: u32 = 8;

const CHUNK_SHIFT: u32 = PAGE_SIZE.trailing_zeros() - NCHUNKS_ORDER;

/// The allocation granularity, in bytes.
pub const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;

/// The number of chunks in a page, header included.
pub const TOTAL_CHUNKS: usize = PAGE_SIZE >> CHUNK_SHIFT;

/// The space reserved for the block header, in bytes.
pub const HEADER_SIZE: usize = 128;

/// The space reserved for the block header, in chunks.
pub const HEADER_CHUNKS: usize = HEADER_SIZE >> CHUNK_SHIFT;

/// The number of chunks available to buddies.
pub const NCHUNKS: usize = TOTAL_CHUNKS - HEADER_CHUNKS;

/// The largest allocation that is packed alongside others.
///
/// Anything larger is stored headless, alone in its own page.
pub const MAX_PACKED_SIZE: usize = PAGE_SIZE - HEADER_SIZE;

/// The smallest gap, in chunks, worth closing by moving a buddy.
///
/// Also bounds how far past an exact fit the compactor looks when choosing a
/// destination page.
pub const BIG_CHUNK_GAP: usize = 3;

/// The maximum number of allocations in one page.
pub const BUDDIES: usize = 4;

const _: () = assert!(HEADER_SIZE % CHUNK_SIZE == 0);
const _: () = assert!(NCHUNKS <= u16::MAX as usize);

/// Returns the number of chunks needed to hold `size` bytes.
///
/// # Errors
///
/// Returns [`AllocError::InvalidSize`] if `size` is zero or exceeds
/// [`PAGE_SIZE`].
pub fn size_to_chunks(size: usize) -> Result<usize, AllocError> {
    if size == 0 || size > PAGE_SIZE {
        return Err(AllocError::InvalidSize(size));
    }

    Ok(size.div_ceil(CHUNK_SIZE))
}

/// Returns `true` if an allocation of `size` bytes takes a page of its own.
pub fn is_headless(size: usize) -> bool {
    size > MAX_PACKED_SIZE
}

/// Converts a chunk index or count to bytes.
pub(crate) const fn chunks_to_bytes(chunks: usize) -> usize {
    chunks << CHUNK_SHIFT
}

/// One of the four allocation slots in a page.
///
/// Slots are ordered by address: a lower slot never lies after a higher one.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Buddy {
    /// Starts immediately after the header.
    First,
    /// Follows FIRST.
    Second,
    /// Follows SECOND.
    Third,
    /// Ends at the page boundary.
    Last,
}

impl Buddy {
    /// All buddies, in address order.
    pub const ALL: [Buddy; BUDDIES] = [Buddy::First, Buddy::Second, Buddy::Third, Buddy::Last];

    /// Returns the position of this buddy in address order.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(index: usize) -> Option<Buddy> {
        Buddy::ALL.get(index).copied()
    }

    /// Returns `true` for SECOND and THIRD.
    pub fn is_middle(self) -> bool {
        matches!(self, Buddy::Second | Buddy::Third)
    }
}
