//! Page relocation.
//!
//! A host that needs to move physical pages (for example to defragment its
//! own memory) isolates a block, copies it into a frame of its choosing and
//! receives the old frame back. While a block is isolated, the pins of all
//! its handles are held on the owners' behalf: allocations cannot be mapped,
//! compacted or evicted, but they can still be freed.

use std::mem;

use log::debug;

use crate::{
    block::{BlockFlags, BlockId, ListPos, LockedBlock},
    geometry::BUDDIES,
    handle::{Handle, HandleTags},
    page::Page,
    pool::{Pool, Shared},
};

/// The error type for page relocation.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum RelocateError {
    /// The block does not exist.
    #[error("no such block")]
    NoSuchBlock,

    /// The block is empty, already isolated, being reclaimed, or has
    /// allocations that are currently mapped or being moved.
    #[error("block is busy")]
    Busy,

    /// The block has not been isolated.
    #[error("block is not isolated")]
    NotIsolated,

    /// Every allocation in the block was freed while it was isolated. The
    /// block has been released and nothing was migrated.
    #[error("block was released while isolated")]
    Released,
}

/// The error type for [`migrate`](Relocatable::migrate).
///
/// The frame passed to `migrate` is handed back, so the host may return it to
/// wherever it came from.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct MigrateError {
    /// Why nothing was migrated.
    pub kind: RelocateError,
    page: Page,
}

impl MigrateError {
    /// Recovers the frame that was to receive the block.
    pub fn into_page(self) -> Page {
        self.page
    }
}

/// The result of a successful [`migrate`](Relocatable::migrate).
#[derive(Debug)]
pub struct Migrated {
    /// The block now holding the migrated allocations.
    pub block: BlockId,
    /// The frame the allocations were copied out of.
    pub old_page: Page,
}

/// Types whose pages may be moved by their host.
pub trait Relocatable {
    /// Isolates `block` in preparation for migration.
    ///
    /// # Errors
    ///
    /// Returns [`RelocateError::NoSuchBlock`] or [`RelocateError::Busy`]. A
    /// failed isolation leaves the block untouched.
    fn isolate(&self, block: BlockId) -> Result<(), RelocateError>;

    /// Copies an isolated block into `new_page` and returns the old frame.
    ///
    /// Handles into the block remain valid and now resolve to the new frame.
    ///
    /// # Errors
    ///
    /// Returns `new_page` inside a [`MigrateError`] whose kind is
    /// [`RelocateError::NoSuchBlock`], [`RelocateError::NotIsolated`] if
    /// `block` is not isolated, or [`RelocateError::Released`] if it was
    /// emptied while isolated.
    fn migrate(&self, block: BlockId, new_page: Page) -> Result<Migrated, MigrateError>;

    /// Ends the isolation of `block` without migrating it.
    ///
    /// # Errors
    ///
    /// Returns [`RelocateError::NoSuchBlock`] or [`RelocateError::NotIsolated`].
    fn unisolate(&self, block: BlockId) -> Result<(), RelocateError>;
}

/// Releases the pins held by an isolation.
///
/// Handles freed during the isolation are destroyed. The rest are pointed at
/// `relocated`, if given.
fn finish_isolation(
    shared: &Shared,
    isolated: &[Option<Handle>; BUDDIES],
    relocated: Option<&LockedBlock>,
) {
    for &handle in isolated.iter().flatten() {
        let entry = shared.handles.entry(handle);

        if !entry.tags().contains(HandleTags::TRANSFERRED) {
            if let Some(block) = relocated {
                let Some(slot) = block.slot_of(handle, block.is_headless()) else {
                    fatal!("{}: {handle:?} lost in migration: {block:?}", shared.name);
                };
                entry.set_location(block.id(), slot);
            }
        }

        let prev = entry.clear_tags(HandleTags::PINNED | HandleTags::ISOLATED);
        if prev.contains(HandleTags::TRANSFERRED) {
            shared.handles.free(handle);
        }
    }
}

impl Relocatable for Pool {
    fn isolate(&self, id: BlockId) -> Result<(), RelocateError> {
        let shared = &*self.shared;
        let Some(block) = shared.arena.get(id) else {
            return Err(RelocateError::NoSuchBlock);
        };

        let mut block = block.lock();
        if block.live == 0
            || block.flags().intersects(
                BlockFlags::STALE | BlockFlags::ISOLATED | BlockFlags::RECLAIM,
            )
        {
            return Err(RelocateError::Busy);
        }

        let mut isolated = [None; BUDDIES];
        let mut pinned = 0;
        for handle in block.live_handles() {
            if !shared.handles.entry(handle).try_pin(HandleTags::ISOLATED) {
                break;
            }
            isolated[pinned] = Some(handle);
            pinned += 1;
        }

        let busy = pinned < usize::from(block.live)
            || (block.list == ListPos::Compact && !shared.dequeue_compaction(&mut block));
        if busy {
            finish_isolation(shared, &isolated, None);
            return Err(RelocateError::Busy);
        }

        shared.buckets.remove(&mut block);
        block.set_flags(BlockFlags::ISOLATED);
        block.get();
        block.isolated = isolated;

        debug!("{}: isolated {id}", shared.name);
        Ok(())
    }

    fn migrate(&self, id: BlockId, new_page: Page) -> Result<Migrated, MigrateError> {
        let shared = &*self.shared;
        let Some(old) = shared.arena.get(id) else {
            return Err(MigrateError {
                kind: RelocateError::NoSuchBlock,
                page: new_page,
            });
        };

        let mut old = old.lock();
        if !old.flags().contains(BlockFlags::ISOLATED) {
            return Err(MigrateError {
                kind: RelocateError::NotIsolated,
                page: new_page,
            });
        }

        let isolated = mem::take(&mut old.isolated);
        old.clear_flags(BlockFlags::ISOLATED);
        old.put();

        if old.live == 0 {
            finish_isolation(shared, &isolated, None);
            shared.settle(old, false);
            debug!("{}: {id} emptied while isolated", shared.name);
            return Err(MigrateError {
                kind: RelocateError::Released,
                page: new_page,
            });
        }

        // SAFETY: the block is locked and every allocation in it is pinned by
        // the isolation, so nobody else reads or writes either frame.
        unsafe { new_page.copy_from(old.page()) };

        let flags = old.flags() & BlockFlags::HEADLESS;
        let mut new = shared.arena.insert_locked(new_page, flags);
        new.adopt(&mut old);
        finish_isolation(shared, &isolated, Some(&new));

        shared.lru.remove(&mut old);
        shared.lru.touch(&mut new);
        let Some(old_page) = old.page.take() else {
            fatal!("{}: isolated {id} has no page", shared.name);
        };
        shared.arena.remove(id);
        drop(old);

        let new_id = new.id();
        let shrank = usize::from(new.live) < isolated.iter().flatten().count();
        shared.settle(new, shrank);

        debug!("{}: migrated {id} to {new_id}", shared.name);
        Ok(Migrated {
            block: new_id,
            old_page,
        })
    }

    fn unisolate(&self, id: BlockId) -> Result<(), RelocateError> {
        let shared = &*self.shared;
        let Some(block) = shared.arena.get(id) else {
            return Err(RelocateError::NoSuchBlock);
        };

        let mut block = block.lock();
        if !block.flags().contains(BlockFlags::ISOLATED) {
            return Err(RelocateError::NotIsolated);
        }

        let isolated = mem::take(&mut block.isolated);
        block.clear_flags(BlockFlags::ISOLATED);
        finish_isolation(shared, &isolated, None);
        block.put();

        let shrank = usize::from(block.live) < isolated.iter().flatten().count();
        debug!("{}: unisolated {id}", shared.name);
        shared.settle(block, shrank);
        Ok(())
    }
}
