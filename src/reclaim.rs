//! LRU-driven reclaim.
//!
//! Every block with live allocations sits on the pool's LRU list, stamped
//! with the time of its last allocation. [`Pool::reclaim`] picks the oldest
//! block and hands each of its handles to the pool's [`Evict`] callback,
//! which is expected to write the data elsewhere and free the handle.
//!
//! While its callback runs, a handle's pin is held by the reclaim with the
//! `EVICTING` tag. An owner freeing the handle meanwhile vacates the slot and
//! transfers the handle to the reclaim, which destroys it afterwards.

use std::{
    collections::BTreeMap,
    sync::atomic::Ordering,
    thread::{self, ThreadId},
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    block::{Arena, BlockFlags, BlockId, LockedBlock},
    geometry::Buddy,
    handle::{Handle, HandleTags},
    pool::{Pool, Shared},
    EvictError, ReclaimError,
};

/// Order in which the handles of a packed block are evicted.
const EVICTION_ORDER: [Buddy; 4] = [Buddy::Third, Buddy::Second, Buddy::Last, Buddy::First];

/// Writes back allocations chosen by [`Pool::reclaim`].
///
/// The callback runs with no pool lock held. It may [`map`](Pool::map) the
/// handle on the calling thread to read it, and should then
/// [`free`](Pool::free) it; a mapping must be dropped before the callback
/// returns. Other threads mapping the handle wait until the callback is done. Returning `Ok` without freeing the
/// handle leaves the page in place.
///
/// Closures of the form `Fn(&Pool, Handle) -> Result<(), EvictError>`
/// implement this trait.
pub trait Evict: Send + Sync {
    /// Evicts the allocation named by `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`EvictError`] if the allocation could not be written back. The
    /// reclaim stops evicting the current page and moves on to the next one.
    fn evict(&self, pool: &Pool, handle: Handle) -> Result<(), EvictError>;
}

impl<F> Evict for F
where
    F: Fn(&Pool, Handle) -> Result<(), EvictError> + Send + Sync,
{
    fn evict(&self, pool: &Pool, handle: Handle) -> Result<(), EvictError> {
        self(pool, handle)
    }
}

/// Victims whose eviction callback is running, and the threads running them.
pub(crate) struct Evictions {
    running: Mutex<Vec<(Handle, ThreadId)>>,
}

impl Evictions {
    pub(crate) fn new() -> Evictions {
        Evictions {
            running: Mutex::new(Vec::new()),
        }
    }

    fn begin(&self, handle: Handle) {
        self.running.lock().push((handle, thread::current().id()));
    }

    fn end(&self, handle: Handle) {
        let mut running = self.running.lock();
        if let Some(pos) = running.iter().position(|&(h, _)| h == handle) {
            running.swap_remove(pos);
        }
    }

    /// Returns `true` if the calling thread is running the eviction callback
    /// for `handle`.
    pub(crate) fn is_current(&self, handle: Handle) -> bool {
        let me = thread::current().id();
        self.running
            .lock()
            .iter()
            .any(|&(h, thread)| h == handle && thread == me)
    }
}

/// Blocks ordered by the time they last received an allocation.
pub(crate) struct Lru {
    inner: Mutex<LruInner>,
}

struct LruInner {
    clock: u64,
    order: BTreeMap<u64, BlockId>,
}

impl Lru {
    pub(crate) fn new() -> Lru {
        Lru {
            inner: Mutex::new(LruInner {
                clock: 0,
                order: BTreeMap::new(),
            }),
        }
    }

    /// Moves `block` to the most-recently-used end.
    pub(crate) fn touch(&self, block: &mut LockedBlock) {
        let mut inner = self.inner.lock();
        if let Some(stamp) = block.lru.take() {
            inner.order.remove(&stamp);
        }

        inner.clock += 1;
        let stamp = inner.clock;
        inner.order.insert(stamp, block.id());
        block.lru = Some(stamp);
    }

    pub(crate) fn remove(&self, block: &mut LockedBlock) {
        if let Some(stamp) = block.lru.take() {
            self.inner.lock().order.remove(&stamp);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    /// Takes the least-recently-used block that can be locked and that
    /// `accept` approves, removing it from the list.
    pub(crate) fn pick_oldest(
        &self,
        arena: &Arena,
        mut accept: impl FnMut(&LockedBlock) -> bool,
    ) -> Option<LockedBlock> {
        let mut inner = self.inner.lock();
        let (stamp, mut block) = inner.order.iter().find_map(|(&stamp, &id)| {
            let block = arena.get(id)?.try_lock()?;
            accept(&block).then_some((stamp, block))
        })?;

        inner.order.remove(&stamp);
        block.lru = None;
        Some(block)
    }
}

/// Gives up the reclaim's pin on a victim.
///
/// Returns `true` if the owner freed the handle meanwhile, in which case the
/// handle is destroyed.
fn release_victim(shared: &Shared, handle: Handle) -> bool {
    let entry = shared.handles.entry(handle);
    let prev = entry.clear_tags(HandleTags::PINNED | HandleTags::EVICTING);
    if prev.contains(HandleTags::TRANSFERRED) {
        shared.handles.free(handle);
        return true;
    }

    false
}

impl Pool {
    /// Evicts the contents of up to `max_pages` least-recently-used pages.
    ///
    /// Returns the number of pages emptied. Emptied packed pages are handed
    /// to the release worker.
    ///
    /// # Errors
    ///
    /// If no page could be emptied, returns [`ReclaimError::NotConfigured`]
    /// when the pool has no eviction callback,
    /// [`ReclaimError::NoCandidates`] when no page is in use, and
    /// [`ReclaimError::RetriesExhausted`] when every candidate examined was
    /// busy or could not be fully evicted.
    pub fn reclaim(&self, max_pages: usize) -> Result<usize, ReclaimError> {
        let Some(evict) = self.evict.as_deref() else {
            return Err(ReclaimError::NotConfigured);
        };

        let mut freed = 0;
        while freed < max_pages {
            match self.reclaim_one(evict) {
                Ok(()) => freed += 1,
                Err(e) if freed == 0 => return Err(e),
                Err(_) => break,
            }
        }

        debug!("{}: reclaimed {freed} pages", self.shared.name);
        Ok(freed)
    }

    fn reclaim_one(&self, evict: &dyn Evict) -> Result<(), ReclaimError> {
        let shared = &*self.shared;
        let mut spins = 0;

        for _ in 0..self.reclaim_retries {
            if shared.lru.is_empty() {
                return Err(ReclaimError::NoCandidates);
            }

            let candidate = shared.lru.pick_oldest(&shared.arena, |b| {
                !b.flags().intersects(
                    BlockFlags::STALE
                        | BlockFlags::ISOLATED
                        | BlockFlags::NEEDS_COMPACTING
                        | BlockFlags::RECLAIM,
                )
            });
            let Some(mut block) = candidate else {
                crate::relax(&mut spins);
                continue;
            };

            block.set_flags(BlockFlags::RECLAIM);
            shared.buckets.remove(&mut block);
            block.get();

            let victims: Vec<Handle> = if block.is_headless() {
                block.handles[0].into_iter().collect()
            } else {
                EVICTION_ORDER
                    .into_iter()
                    .filter_map(|b| block.handles[b.index()])
                    .collect()
            };

            let mut pinned = Vec::with_capacity(victims.len());
            for &handle in &victims {
                let entry = shared.handles.entry(handle);
                if entry.tags().contains(HandleTags::FREE) || !entry.try_pin(HandleTags::EVICTING) {
                    break;
                }
                pinned.push(handle);
            }

            if pinned.len() < victims.len() {
                for &handle in &pinned {
                    release_victim(shared, handle);
                }

                block.clear_flags(BlockFlags::RECLAIM);
                block.put();
                shared.lru.touch(&mut block);
                shared.settle(block, false);
                continue;
            }

            let id = block.id();
            drop(block);

            let mut failed = false;
            let mut evicted = 0;
            for &handle in &victims {
                if failed || shared.handles.entry(handle).tags().contains(HandleTags::TRANSFERRED) {
                    if release_victim(shared, handle) {
                        evicted += 1;
                    }
                    continue;
                }

                shared.evictions.begin(handle);
                let result = evict.evict(self, handle);
                shared.evictions.end(handle);
                let freed = release_victim(shared, handle);
                match result {
                    Ok(()) if !freed => {
                        warn!("{}: evict callback kept {handle:?}", shared.name);
                    }
                    Ok(()) => evicted += 1,
                    Err(e) => {
                        debug!("{}: evicting {handle:?} from {id}: {e}", shared.name);
                        failed = true;
                    }
                }
            }

            let Some(block) = shared.arena.get(id) else {
                fatal!("{}: {id} vanished during reclaim", shared.name);
            };

            let Some(mut block) = block.try_lock() else {
                block.set_flags(BlockFlags::ORPHANED);
                shared.buckets.push_orphan(id);
                shared.stats.orphans.fetch_add(1, Ordering::Relaxed);
                warn!("{}: could not relock {id} after reclaim; orphaned", shared.name);
                shared.released.wake();

                if evicted == victims.len() {
                    return Ok(());
                }
                continue;
            };

            block.clear_flags(BlockFlags::RECLAIM);
            block.put();
            let emptied = block.live == 0;
            let shrank = usize::from(block.live) < victims.len();
            if !emptied {
                shared.lru.touch(&mut block);
            }
            shared.settle(block, shrank);

            if emptied {
                return Ok(());
            }
        }

        Err(ReclaimError::RetriesExhausted)
    }
}
