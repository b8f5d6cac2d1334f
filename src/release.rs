//! Page release.
//!
//! Frees never return pages directly. An emptied block is marked stale and
//! pushed onto the stale list; the release worker later detaches its page and
//! hands it back to the [`PageSource`](crate::PageSource). Until then a
//! blocking allocation may recycle the page instead of asking the source for
//! a new one.
//!
//! The release worker also settles orphans: blocks whose reclaim finished
//! evicting but could not relock them afterwards.

use std::sync::atomic::Ordering;

use log::trace;

use crate::{
    block::{BlockFlags, BlockId, ListPos},
    page::Page,
    pool::Shared,
};

impl Shared {
    /// Settles every orphan, then releases every stale page.
    pub(crate) fn release_all(&self) {
        loop {
            let next = self.buckets.pop_orphan();
            let Some(id) = next else { break };
            self.adopt_orphan(id);
        }

        let mut released = 0_u64;
        loop {
            let next = self.stale.lock().pop_front();
            let Some(id) = next else { break };

            let page = self.take_stale_page(id);
            self.source.free_page(page);
            self.stats.pages.fetch_sub(1, Ordering::Relaxed);
            released += 1;
        }

        if released != 0 {
            trace!("{}: released {released} pages", self.name);
        }
    }

    /// Takes the page of a stale block for a new allocation.
    pub(crate) fn reuse_stale_page(&self) -> Option<Page> {
        let next = self.stale.lock().pop_front();
        next.map(|id| self.take_stale_page(id))
    }

    /// Removes a stale block from the arena and returns its page.
    fn take_stale_page(&self, id: BlockId) -> Page {
        let Some(block) = self.arena.get(id) else {
            fatal!("{}: stale {id} is missing", self.name);
        };

        let mut block = block.lock();
        if !block.flags().contains(BlockFlags::STALE)
            || block.list != ListPos::Stale
            || block.live != 0
            || block.refcount != 0
        {
            fatal!("{}: releasing {id}, which is in use: {block:?}", self.name);
        }

        block.list = ListPos::Unlisted;
        let Some(page) = block.page.take() else {
            fatal!("{}: stale {id} has no page", self.name);
        };
        self.arena.remove(id);
        drop(block);

        self.stats.stale.fetch_sub(1, Ordering::Relaxed);
        page
    }

    /// Finishes a reclaim that could not relock its block.
    fn adopt_orphan(&self, id: BlockId) {
        let Some(block) = self.arena.get(id) else {
            fatal!("{}: orphaned {id} is missing", self.name);
        };

        let mut block = block.lock();
        if !block
            .clear_flags(BlockFlags::ORPHANED | BlockFlags::RECLAIM)
            .contains(BlockFlags::ORPHANED)
        {
            fatal!("{}: {id} in the orphan bucket is not orphaned: {block:?}", self.name);
        }

        block.put();
        self.stats.orphans.fetch_sub(1, Ordering::Relaxed);
        if block.live != 0 {
            self.lru.touch(&mut block);
        }

        trace!("{}: adopted orphaned {id}", self.name);
        self.settle(block, true);
    }
}
