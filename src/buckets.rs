//! Size-class free lists.
//!
//! A block that can take another buddy is listed in the bucket matching its
//! largest free run, measured in chunks. Allocation scans buckets upward from
//! the requested size, so the first block found is the tightest fit among
//! the buckets scanned.
//!
//! Bucket 0 never holds a block with free space; it is the orphan bucket,
//! where reclaim parks blocks it could not relock.
//!
//! Blocks found in a bucket are only ever *try*-locked, because the bucket
//! lock is already held and ranks above block locks.

use std::{collections::VecDeque, ops::Range};

use parking_lot::Mutex;

use crate::{
    block::{Arena, BlockId, ListPos, LockedBlock},
    geometry::{BUDDIES, NCHUNKS},
};

/// The bucket that holds orphaned blocks.
pub(crate) const ORPHAN_BUCKET: usize = 0;

pub(crate) struct Buckets {
    lists: Box<[Mutex<VecDeque<BlockId>>]>,
}

impl Buckets {
    pub(crate) fn new() -> Buckets {
        Buckets {
            lists: (0..NCHUNKS).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    /// Lists `block` under its largest free run, if it can take another buddy.
    ///
    /// Returns `true` if the block was listed.
    pub(crate) fn insert(&self, block: &mut LockedBlock) -> bool {
        if block.list != ListPos::Unlisted {
            fatal!("{}: listing a block that is already listed: {block:?}", block.id());
        }

        if block.is_headless() || block.live == 0 || usize::from(block.live) == BUDDIES {
            return false;
        }

        let free = block.free_chunks();
        if free == ORPHAN_BUCKET {
            return false;
        }

        self.lists[free].lock().push_back(block.id());
        block.list = ListPos::Bucket(free);
        true
    }

    /// Removes `block` from its bucket, if it is in one.
    pub(crate) fn remove(&self, block: &mut LockedBlock) -> bool {
        let ListPos::Bucket(k) = block.list else {
            return false;
        };

        let mut list = self.lists[k].lock();
        match list.iter().position(|&id| id == block.id()) {
            Some(pos) => {
                list.remove(pos);
            }
            None => fatal!("{}: missing from bucket {k}: {block:?}", block.id()),
        }
        drop(list);

        block.list = ListPos::Unlisted;
        true
    }

    /// Takes the first block that can be locked from the buckets in `classes`.
    ///
    /// The block is returned locked and unlisted.
    pub(crate) fn take(&self, arena: &Arena, classes: Range<usize>) -> Option<LockedBlock> {
        let classes = classes.start.max(ORPHAN_BUCKET + 1)..classes.end.min(NCHUNKS);

        for k in classes {
            let mut list = self.lists[k].lock();
            let found = list.iter().enumerate().find_map(|(pos, &id)| {
                let block = arena.get(id)?.try_lock()?;
                Some((pos, block))
            });

            if let Some((pos, mut block)) = found {
                list.remove(pos);
                drop(list);

                if block.list != ListPos::Bucket(k) {
                    fatal!("{}: found in bucket {k}: {block:?}", block.id());
                }
                block.list = ListPos::Unlisted;
                return Some(block);
            }
        }

        None
    }

    pub(crate) fn push_orphan(&self, id: BlockId) {
        self.lists[ORPHAN_BUCKET].lock().push_back(id);
    }

    pub(crate) fn pop_orphan(&self) -> Option<BlockId> {
        self.lists[ORPHAN_BUCKET].lock().pop_front()
    }

    pub(crate) fn has_orphans(&self) -> bool {
        !self.lists[ORPHAN_BUCKET].lock().is_empty()
    }
}
