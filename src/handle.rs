//! Handle indirection.
//!
//! Callers never hold pointers into a page. An allocation is named by a
//! [`Handle`], which indexes an entry in the pool's [`HandleCache`]. The entry
//! records which block and slot currently hold the allocation; when the
//! compactor or a migration moves the bytes, only the entry is rewritten and
//! the `Handle` itself stays valid.
//!
//! Each entry is a single atomic word: the low bits encode the location and
//! the high bits carry [`HandleTags`]. `PINNED` is an exclusion bit: whoever
//! holds it may move, map, or free the allocation, and nobody else may.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(1)       |
//! | Free                     | O(1)      | O(1)       |
//! | Lookup                   | O(1)      | O(1)       |
//!
//! Entries are stored in fixed-size segments which are created on first use
//! and never move, so lookups take no lock.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    OnceLock,
};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{
    block::{BlockId, Slot},
    geometry::Buddy,
    AllocError,
};

/// An opaque reference to an allocation in a [`Pool`](crate::Pool).
///
/// Handles are cheap to copy and remain valid while the allocation is moved
/// around by the pool. They become invalid once passed to
/// [`Pool::free`](crate::Pool::free); using a freed handle is a fatal error.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    index: u32,
    generation: u32,
}

bitflags! {
    /// State bits stored alongside a handle's location.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct HandleTags: u64 {
        /// The entry has been issued.
        const LIVE = 1 << 40;
        /// The owner has started freeing the allocation.
        const FREE = 1 << 41;
        /// Someone holds exclusive access to the allocation.
        const PINNED = 1 << 42;
        /// At least one mapping is waiting for the pin.
        const CONTENDED = 1 << 43;
        /// The pin is held by a page isolation.
        const ISOLATED = 1 << 44;
        /// The pin is held by a reclaim in progress.
        const EVICTING = 1 << 45;
        /// The allocation was freed while held; the holder destroys the handle.
        const TRANSFERRED = 1 << 46;

        /// Tags naming a party that holds the pin on the owner's behalf.
        const HELD = Self::ISOLATED.bits() | Self::EVICTING.bits();
    }
}

const BLOCK_MASK: u64 = 0xFFFF_FFFF;
const SLOT_SHIFT: u32 = 32;
const SLOT_MASK: u64 = 0x7 << SLOT_SHIFT;
const HEADLESS_SLOT: u64 = 4;
const TAG_MASK: u64 = !(BLOCK_MASK | SLOT_MASK);

// The number of mappings waiting for the pin lives above the tags, so that it
// changes in the same step as PINNED and CONTENDED.
const WAITER_SHIFT: u32 = 48;
const WAITER: u64 = 1 << WAITER_SHIFT;
const WAITER_MASK: u64 = !0 << WAITER_SHIFT;

fn encode(block: BlockId, slot: Slot) -> u64 {
    let slot = match slot {
        Slot::Buddy(b) => b.index() as u64,
        Slot::Headless => HEADLESS_SLOT,
    };

    u64::from(block.raw()) | (slot << SLOT_SHIFT)
}

fn decode(word: u64) -> (BlockId, Slot) {
    let block = BlockId::from_raw((word & BLOCK_MASK) as u32);
    let slot = match (word & SLOT_MASK) >> SLOT_SHIFT {
        HEADLESS_SLOT => Slot::Headless,
        i => match Buddy::from_index(i as usize) {
            Some(b) => Slot::Buddy(b),
            None => fatal!("corrupt handle word {word:#x}"),
        },
    };

    (block, slot)
}

/// A handle cache entry.
pub(crate) struct HandleEntry {
    word: AtomicU64,
    generation: AtomicU32,
}

impl HandleEntry {
    fn new() -> HandleEntry {
        HandleEntry {
            word: AtomicU64::new(0),
            generation: AtomicU32::new(0),
        }
    }

    pub(crate) fn tags(&self) -> HandleTags {
        HandleTags::from_bits_truncate(self.word.load(Ordering::Acquire))
    }

    /// Returns the block and slot currently holding the allocation.
    pub(crate) fn location(&self) -> (BlockId, Slot) {
        decode(self.word.load(Ordering::Acquire))
    }

    /// Rewrites the location, preserving the tags.
    pub(crate) fn set_location(&self, block: BlockId, slot: Slot) {
        let loc = encode(block, slot);
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            match self.word.compare_exchange_weak(
                word,
                (word & TAG_MASK) | loc,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    /// Sets `tags`, returning the previous tags.
    pub(crate) fn set_tags(&self, tags: HandleTags) -> HandleTags {
        HandleTags::from_bits_truncate(self.word.fetch_or(tags.bits(), Ordering::AcqRel))
    }

    /// Clears `tags`, returning the previous tags.
    pub(crate) fn clear_tags(&self, tags: HandleTags) -> HandleTags {
        HandleTags::from_bits_truncate(self.word.fetch_and(!tags.bits(), Ordering::AcqRel))
    }

    /// Takes the pin if nobody holds it, setting `extra` in the same step.
    pub(crate) fn try_pin(&self, extra: HandleTags) -> bool {
        self.update(|word| {
            (word & HandleTags::PINNED.bits() == 0)
                .then_some(word | HandleTags::PINNED.bits() | extra.bits())
        })
    }

    /// Takes the pin, spinning while someone else holds it.
    ///
    /// While it waits the caller is counted as a waiter, and the entry is
    /// tagged `CONTENDED` for as long as any waiter remains.
    pub(crate) fn pin(&self) {
        if self.try_pin(HandleTags::empty()) {
            return;
        }

        self.update(|word| Some((word + WAITER) | HandleTags::CONTENDED.bits()));

        let mut spins = 0;
        loop {
            let won = self.update(|word| {
                (word & HandleTags::PINNED.bits() == 0).then(|| {
                    let word = (word | HandleTags::PINNED.bits()) - WAITER;
                    if word & WAITER_MASK == 0 {
                        word & !HandleTags::CONTENDED.bits()
                    } else {
                        word
                    }
                })
            });

            if won {
                return;
            }
            crate::relax(&mut spins);
        }
    }

    /// Hands the handle of a freed allocation to the party holding its pin.
    ///
    /// Returns `false` if no isolation or reclaim holds the pin any more, in
    /// which case the caller destroys the handle.
    pub(crate) fn transfer(&self) -> bool {
        self.update(|word| {
            (word & HandleTags::HELD.bits() != 0).then_some(word | HandleTags::TRANSFERRED.bits())
        })
    }

    fn update(&self, f: impl FnMut(u64) -> Option<u64>) -> bool {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, f)
            .is_ok()
    }

    pub(crate) fn unpin(&self) {
        self.clear_tags(HandleTags::PINNED);
    }
}

const SEGMENT_SHIFT: u32 = 10;
const SEGMENT_LEN: usize = 1 << SEGMENT_SHIFT;
const SEGMENT_MASK: usize = SEGMENT_LEN - 1;
const MAX_SEGMENTS: usize = 4096;

/// Issues and recycles handle entries.
pub(crate) struct HandleCache {
    segments: Box<[OnceLock<Box<[HandleEntry]>>]>,
    capacity: u32,
    next: AtomicU32,
    free_list: Mutex<Vec<u32>>,
    live: AtomicUsize,
}

impl HandleCache {
    pub(crate) fn new() -> HandleCache {
        HandleCache::with_capacity(MAX_SEGMENTS * SEGMENT_LEN)
    }

    /// Constructs a cache that issues at most `capacity` handles at a time.
    pub(crate) fn with_capacity(capacity: usize) -> HandleCache {
        let capacity = capacity.min(MAX_SEGMENTS * SEGMENT_LEN);
        let num_segments = capacity.div_ceil(SEGMENT_LEN);

        HandleCache {
            segments: (0..num_segments).map(|_| OnceLock::new()).collect(),
            // Cannot truncate: capacity is capped above.
            capacity: capacity as u32,
            next: AtomicU32::new(0),
            free_list: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        }
    }

    /// Issues a new handle.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfMemory`] if every entry is in use.
    pub(crate) fn alloc(&self) -> Result<Handle, AllocError> {
        let recycled = self.free_list.lock().pop();
        let index = match recycled {
            Some(i) => i,
            None => self
                .next
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.capacity).then_some(n + 1)
                })
                .map_err(|_| AllocError::OutOfMemory)?,
        };

        let entry = self.slot(index);
        entry
            .word
            .store(HandleTags::LIVE.bits(), Ordering::Release);
        self.live.fetch_add(1, Ordering::Relaxed);

        Ok(Handle {
            index,
            generation: entry.generation.load(Ordering::Acquire),
        })
    }

    fn slot(&self, index: u32) -> &HandleEntry {
        let index = index as usize;
        let segment = self.segments[index >> SEGMENT_SHIFT]
            .get_or_init(|| (0..SEGMENT_LEN).map(|_| HandleEntry::new()).collect());

        &segment[index & SEGMENT_MASK]
    }

    /// Returns the entry for `handle`.
    ///
    /// Fatal if `handle` was not issued by this cache or has been freed.
    pub(crate) fn entry(&self, handle: Handle) -> &HandleEntry {
        let index = handle.index as usize;
        let entry = self
            .segments
            .get(index >> SEGMENT_SHIFT)
            .and_then(OnceLock::get)
            .map(|segment| &segment[index & SEGMENT_MASK]);

        match entry {
            Some(e)
                if e.generation.load(Ordering::Acquire) == handle.generation
                    && e.tags().contains(HandleTags::LIVE) =>
            {
                e
            }
            _ => fatal!("{handle:?} was not issued by this pool or has already been freed"),
        }
    }

    /// Destroys `handle`, making its entry available for reuse.
    ///
    /// Fatal if the handle is pinned.
    pub(crate) fn free(&self, handle: Handle) {
        let entry = self.entry(handle);
        let tags = entry.tags();
        if tags.contains(HandleTags::PINNED) {
            fatal!("freeing pinned {handle:?} ({tags:?})");
        }

        entry.word.store(0, Ordering::Release);
        entry.generation.fetch_add(1, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free_list.lock().push(handle.index);
    }

    /// Returns the number of handles currently issued.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}
