//! Compaction.
//!
//! A block that loses a buddy is queued for the compactor, which either
//! empties it or closes the gaps inside it:
//!
//! - If the block holds two buddies or fewer, each movable buddy is migrated
//!   into a block from a bucket between its own size and
//!   [`BIG_CHUNK_GAP`](crate::geometry::BIG_CHUNK_GAP) chunks larger, so only
//!   near-exact fits are used. A block emptied this way goes stale.
//! - Otherwise the middle buddies are slid toward the header, but only across
//!   gaps of at least `BIG_CHUNK_GAP` chunks.
//!
//! A buddy is movable only if its pin can be taken and neither its owner nor a
//! mapping is waiting on it. Buddies that cannot be moved stay where they are.

use std::ptr;

use log::trace;

use crate::{
    block::{BlockFlags, BlockId, ListPos, LockedBlock, Slot},
    geometry::{Buddy, BIG_CHUNK_GAP, HEADER_CHUNKS},
    handle::{HandleEntry, HandleTags},
    pool::Shared,
};

/// Takes the pin on behalf of the compactor.
fn pin_movable(entry: &HandleEntry) -> bool {
    !entry
        .tags()
        .intersects(HandleTags::FREE | HandleTags::CONTENDED)
        && entry.try_pin(HandleTags::empty())
}

impl Shared {
    /// Compacts every queued block.
    pub(crate) fn compact_all(&self) {
        loop {
            let next = self.compact_queue.lock().pop_front();
            let Some(id) = next else { break };
            self.compact(id);
        }
    }

    fn compact(&self, id: BlockId) {
        let Some(block) = self.arena.get(id) else {
            fatal!("{}: queued {id} is missing", self.name);
        };

        let mut block = block.lock();
        if block.list != ListPos::Compact {
            fatal!("{}: compacting unqueued {id}: {block:?}", self.name);
        }

        block.list = ListPos::Unlisted;
        block.clear_flags(BlockFlags::NEEDS_COMPACTING);
        block.put();

        if block.refcount == 0 {
            self.release_block(block);
            return;
        }

        if block
            .flags()
            .intersects(BlockFlags::ISOLATED | BlockFlags::RECLAIM)
        {
            return;
        }

        if block.live <= 2 {
            match self.migrate_out(block) {
                Some(b) => block = b,
                None => return,
            }
        }

        self.compact_in_place(&mut block);
        self.buckets.insert(&mut block);
    }

    /// Moves buddies out of a sparsely populated block.
    ///
    /// Returns the block unless it was emptied and released.
    fn migrate_out(&self, mut block: LockedBlock) -> Option<LockedBlock> {
        for buddy in Buddy::ALL {
            let Some(handle) = block.handles[buddy.index()] else {
                continue;
            };

            let entry = self.handles.entry(handle);
            if !pin_movable(entry) {
                continue;
            }

            let chunks = block.len_of(buddy);
            let Some(mut dest) = self
                .buckets
                .take(&self.arena, chunks..chunks + BIG_CHUNK_GAP)
            else {
                entry.unpin();
                continue;
            };

            let Some(to) = dest.fit(chunks) else {
                fatal!(
                    "{}: {} was listed with room for {chunks} chunks but has none: {dest:?}",
                    self.name,
                    dest.id()
                );
            };

            let (offset, len) = block.byte_range(Slot::Buddy(buddy));
            dest.place(to, chunks, len, handle);
            let (dest_offset, _) = dest.byte_range(Slot::Buddy(to));

            let src = block.page().byte_ptr(offset);
            let dst = dest.page().byte_ptr(dest_offset);
            // SAFETY: both ranges lie within their pages, the pages are
            // distinct and both blocks are locked.
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len) };

            entry.set_location(dest.id(), Slot::Buddy(to));
            self.buckets.insert(&mut dest);
            self.lru.touch(&mut dest);
            trace!(
                "{}: migrated {handle:?} from {} {buddy:?} to {} {to:?}",
                self.name,
                block.id(),
                dest.id()
            );
            drop(dest);

            block.vacate(Slot::Buddy(buddy));
            entry.unpin();
        }

        if block.refcount == 0 {
            self.release_block(block);
            return None;
        }

        Some(block)
    }

    fn compact_in_place(&self, block: &mut LockedBlock) {
        if !block.is_occupied(Buddy::First) {
            let lowest = Buddy::ALL
                .into_iter()
                .find(|b| b.is_middle() && block.is_occupied(*b));

            if let Some(from) = lowest {
                let gap = block.start_of(from) - HEADER_CHUNKS;
                if gap == 0 || gap >= BIG_CHUNK_GAP {
                    self.move_buddy(block, from, Buddy::First, HEADER_CHUNKS);
                }
            }
        }

        for buddy in Buddy::ALL.into_iter().filter(|b| b.is_middle()) {
            if !block.is_occupied(buddy) {
                continue;
            }

            let floor = block.floor(buddy);
            if block.start_of(buddy) - floor >= BIG_CHUNK_GAP {
                self.move_buddy(block, buddy, buddy, floor);
            }
        }
    }

    /// Slides buddy `from` to chunk `start` of the same page, renaming it `to`.
    fn move_buddy(&self, block: &mut LockedBlock, from: Buddy, to: Buddy, start: usize) -> bool {
        let Some(handle) = block.handles[from.index()] else {
            return false;
        };

        let entry = self.handles.entry(handle);
        if !pin_movable(entry) {
            return false;
        }

        let (offset, len) = block.byte_range(Slot::Buddy(from));
        let src = block.page().byte_ptr(offset);
        let dst = block.chunk_ptr(start);
        // SAFETY: both ranges lie within the locked page; they may overlap.
        unsafe { ptr::copy(src.as_ptr(), dst.as_ptr(), len) };

        block.shift(from, to, start);
        entry.set_location(block.id(), Slot::Buddy(to));
        entry.unpin();

        trace!(
            "{}: moved {handle:?} in {} from {from:?} to {to:?} at chunk {start}",
            self.name,
            block.id()
        );
        true
    }
}
