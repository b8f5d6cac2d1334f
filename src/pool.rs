//! The pool: allocation, free, and mapping.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                 |
//! |--------------------------|-----------|----------------------------|
//! | Allocate                 | O(1)      | O(b), b = listed blocks    |
//! | Free                     | O(1)      | O(b)                       |
//! | Map                      | O(1)      | O(1)                       |
//!
//! Freeing never blocks on I/O or on the page source: emptied pages are
//! queued for the release worker.
//!
//! #### Fragmentation
//!
//! Internal fragmentation is less than one chunk per allocation, plus the
//! page header. External fragmentation is bounded by the compactor, which
//! closes gaps of [`BIG_CHUNK_GAP`](crate::geometry::BIG_CHUNK_GAP) chunks or
//! more and migrates buddies out of sparsely populated pages.

use std::{
    collections::VecDeque,
    fmt,
    ops::Deref,
    ptr::NonNull,
    slice,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    block::{Arena, BlockFlags, BlockId, ListPos, LockedBlock, Slot},
    buckets::Buckets,
    geometry::{self, Buddy, CHUNK_SIZE, NCHUNKS, PAGE_SIZE},
    handle::{Handle, HandleCache, HandleEntry, HandleTags},
    page::{Global, PageSource},
    reclaim::{Evict, Evictions, Lru},
    worker::{self, Role, Waker},
    AllocError, AllocInitError, DestroyError, EvictError,
};

/// Page and block counters.
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) pages: AtomicU64,
    pub(crate) headless: AtomicU64,
    pub(crate) stale: AtomicU64,
    pub(crate) orphans: AtomicU64,
}

/// State shared between a pool and its workers.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) arena: Arena,
    pub(crate) handles: HandleCache,
    pub(crate) buckets: Buckets,
    pub(crate) lru: Lru,
    pub(crate) evictions: Evictions,
    pub(crate) compact_queue: Mutex<VecDeque<BlockId>>,
    pub(crate) stale: Mutex<VecDeque<BlockId>>,
    pub(crate) source: Box<dyn PageSource>,
    pub(crate) stats: Stats,
    pub(crate) compactd: Waker,
    pub(crate) released: Waker,
}

/// Spins for the pin on behalf of `free`.
///
/// Returns `false` without the pin if an isolation or reclaim holds it on the
/// owner's behalf.
fn pin_for_free(entry: &HandleEntry) -> bool {
    let mut spins = 0;
    loop {
        if entry.try_pin(HandleTags::empty()) {
            return true;
        }

        if entry.tags().intersects(HandleTags::HELD) {
            return false;
        }

        crate::relax(&mut spins);
    }
}

impl Shared {
    pub(crate) fn alloc(&self, size: usize, may_block: bool) -> Result<Handle, AllocError> {
        if size == 0 || size > PAGE_SIZE {
            return Err(AllocError::InvalidSize(size));
        }

        let handle = self.handles.alloc()?;
        let placed = if geometry::is_headless(size) {
            self.alloc_headless(handle, size, may_block)
        } else {
            self.alloc_packed(handle, size, may_block)
        };

        match placed {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.handles.free(handle);
                Err(e)
            }
        }
    }

    fn alloc_headless(&self, handle: Handle, size: usize, may_block: bool) -> Result<(), AllocError> {
        let mut block = self.new_block(may_block, BlockFlags::HEADLESS)?;
        block.occupy_headless(handle, size);
        self.handles
            .entry(handle)
            .set_location(block.id(), Slot::Headless);
        self.lru.touch(&mut block);
        self.stats.headless.fetch_add(1, Ordering::Relaxed);

        trace!("{}: {handle:?} -> {} (headless)", self.name, block.id());
        Ok(())
    }

    fn alloc_packed(&self, handle: Handle, size: usize, may_block: bool) -> Result<(), AllocError> {
        let chunks = geometry::size_to_chunks(size)?;

        let mut block = match self.buckets.take(&self.arena, chunks..NCHUNKS) {
            Some(block) => block,
            None => self.new_block(may_block, BlockFlags::empty())?,
        };

        if block.flags().contains(BlockFlags::STALE) {
            fatal!("{}: allocating from stale {}: {block:?}", self.name, block.id());
        }

        let Some(buddy) = block.fit(chunks) else {
            fatal!(
                "{}: {} was listed with room for {chunks} chunks but has none: {block:?}",
                self.name,
                block.id()
            );
        };

        block.place(buddy, chunks, size, handle);
        self.handles
            .entry(handle)
            .set_location(block.id(), Slot::Buddy(buddy));
        self.buckets.insert(&mut block);
        self.lru.touch(&mut block);

        trace!("{}: {handle:?} -> {} {buddy:?}", self.name, block.id());
        Ok(())
    }

    /// Creates a block over a recycled stale page or a fresh one.
    fn new_block(&self, may_block: bool, flags: BlockFlags) -> Result<LockedBlock, AllocError> {
        let reused = if may_block {
            self.reuse_stale_page()
        } else {
            None
        };

        let page = match reused {
            Some(page) => page,
            None => {
                let page = self
                    .source
                    .alloc_page(may_block)
                    .ok_or(AllocError::OutOfMemory)?;
                self.stats.pages.fetch_add(1, Ordering::Relaxed);
                page
            }
        };

        Ok(self.arena.insert_locked(page, flags))
    }

    pub(crate) fn free(&self, handle: Handle) {
        let entry = self.handles.entry(handle);
        if entry.set_tags(HandleTags::FREE).contains(HandleTags::FREE) {
            fatal!("{}: double free of {handle:?}", self.name);
        }

        loop {
            let pinned = pin_for_free(entry);
            let (mut block, slot) = self.lock_owner(handle, entry, pinned);
            let held = entry.tags().intersects(HandleTags::HELD);

            if !pinned && !held {
                // The holder let go while we waited for the block.
                continue;
            }

            block.vacate(slot);
            if pinned {
                entry.unpin();
                self.handles.free(handle);
            } else if !entry.transfer() {
                // The holder let go after `held` was read. Nobody else pins a
                // handle whose slot is vacated.
                self.handles.free(handle);
            }

            trace!("{}: freed {handle:?} from {} {slot:?}", self.name, block.id());
            self.after_free(block);
            return;
        }
    }

    fn after_free(&self, mut block: LockedBlock) {
        if block.refcount == 0 {
            self.release_block(block);
            return;
        }

        if block.is_headless()
            || block
                .flags()
                .intersects(BlockFlags::ISOLATED | BlockFlags::RECLAIM)
        {
            return;
        }

        if block.live == 0 {
            // Only a compaction queue entry still references the block. If the
            // compactor has already dequeued it, the compactor releases it.
            self.buckets.remove(&mut block);
            if self.dequeue_compaction(&mut block) && block.refcount == 0 {
                self.release_block(block);
            }
            return;
        }

        self.queue_compaction(block);
    }

    /// Locks the block holding `handle` and returns it with the handle's slot.
    ///
    /// If `strict`, the caller holds the handle's pin, so the location cannot
    /// change and a mismatch is fatal. Otherwise the location is re-read until
    /// it is stable.
    pub(crate) fn lock_owner(
        &self,
        handle: Handle,
        entry: &HandleEntry,
        strict: bool,
    ) -> (LockedBlock, Slot) {
        let mut spins = 0;
        loop {
            let (id, slot) = entry.location();
            match self.arena.get(id) {
                Some(block) => {
                    let block = block.lock();
                    if block.holds(slot, handle) {
                        return (block, slot);
                    }

                    if strict {
                        fatal!(
                            "{}: {handle:?} decodes to {id}, which does not hold it: {block:?}",
                            self.name
                        );
                    }
                }
                None if strict => {
                    fatal!("{}: {handle:?} decodes to missing {id}", self.name);
                }
                None => (),
            }

            crate::relax(&mut spins);
        }
    }

    /// Puts `block` on the compaction queue unless it is already there.
    pub(crate) fn queue_compaction(&self, mut block: LockedBlock) {
        if block
            .set_flags(BlockFlags::NEEDS_COMPACTING)
            .contains(BlockFlags::NEEDS_COMPACTING)
        {
            return;
        }

        self.buckets.remove(&mut block);
        block.get();
        block.list = ListPos::Compact;
        self.compact_queue.lock().push_back(block.id());
        drop(block);

        self.compactd.wake();
    }

    /// Takes `block` back off the compaction queue, dropping the queue's
    /// reference.
    ///
    /// Returns `false` if the block was not queued, or if the compactor has
    /// already dequeued it and is waiting for its lock.
    pub(crate) fn dequeue_compaction(&self, block: &mut LockedBlock) -> bool {
        if block.list != ListPos::Compact {
            return false;
        }

        let mut queue = self.compact_queue.lock();
        let Some(pos) = queue.iter().position(|&id| id == block.id()) else {
            return false;
        };
        queue.remove(pos);
        drop(queue);

        block.list = ListPos::Unlisted;
        block.clear_flags(BlockFlags::NEEDS_COMPACTING);
        block.put();
        true
    }

    /// Puts a block back into circulation after a holder dropped its reference.
    ///
    /// If `shrank`, buddies were freed while the block was held and it is
    /// queued for compaction; otherwise it is listed in its bucket.
    pub(crate) fn settle(&self, mut block: LockedBlock, shrank: bool) {
        if block.refcount == 0 {
            self.release_block(block);
            return;
        }

        if block.is_headless()
            || block.list != ListPos::Unlisted
            || block
                .flags()
                .intersects(BlockFlags::ISOLATED | BlockFlags::RECLAIM)
        {
            return;
        }

        if shrank {
            self.queue_compaction(block);
        } else {
            self.buckets.insert(&mut block);
        }
    }

    /// Disposes of a block whose last reference was dropped.
    pub(crate) fn release_block(&self, block: LockedBlock) {
        if block.is_headless() {
            self.free_headless(block);
        } else {
            self.retire(block);
        }
    }

    /// Moves an empty block to the stale list for the release worker.
    fn retire(&self, mut block: LockedBlock) {
        self.buckets.remove(&mut block);
        self.lru.remove(&mut block);
        block.clear_flags(BlockFlags::NEEDS_COMPACTING);
        block.set_flags(BlockFlags::STALE);
        block.list = ListPos::Stale;

        self.stale.lock().push_back(block.id());
        self.stats.stale.fetch_add(1, Ordering::Relaxed);
        trace!("{}: {} is stale", self.name, block.id());
        drop(block);

        self.released.wake();
    }

    /// Frees a headless page immediately.
    fn free_headless(&self, mut block: LockedBlock) {
        self.lru.remove(&mut block);
        block.set_flags(BlockFlags::STALE);
        let page = block.page.take();
        let id = block.id();
        self.arena.remove(id);
        drop(block);

        if let Some(page) = page {
            self.source.free_page(page);
        }
        self.stats.pages.fetch_sub(1, Ordering::Relaxed);
        self.stats.headless.fetch_sub(1, Ordering::Relaxed);
        trace!("{}: released headless {id}", self.name);
    }
}

/// How a pool's background work is driven.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Background {
    /// Compaction and page release run on dedicated worker threads.
    #[default]
    Threads,
    /// No threads are spawned. Queued work runs only when the owner calls
    /// [`Pool::run_compaction`], [`Pool::run_release`] or [`Pool::flush`].
    Manual,
}

/// Configures and constructs a [`Pool`].
pub struct PoolBuilder {
    name: String,
    evict: Option<Box<dyn Evict>>,
    source: Box<dyn PageSource>,
    background: Background,
    reclaim_retries: u32,
}

impl PoolBuilder {
    /// The default number of candidates [`Pool::reclaim`] examines per page.
    pub const DEFAULT_RECLAIM_RETRIES: u32 = 8;

    /// Sets the eviction callback used by [`Pool::reclaim`].
    pub fn evictor(mut self, evict: impl Evict + 'static) -> PoolBuilder {
        self.evict = Some(Box::new(evict));
        self
    }

    /// Sets the eviction callback used by [`Pool::reclaim`] from a closure.
    pub fn evict_with<F>(self, f: F) -> PoolBuilder
    where
        F: Fn(&Pool, Handle) -> Result<(), EvictError> + Send + Sync + 'static,
    {
        self.evictor(f)
    }

    /// Sets the source of page frames. Defaults to [`Global`].
    pub fn page_source(mut self, source: impl PageSource + 'static) -> PoolBuilder {
        self.source = Box::new(source);
        self
    }

    /// Sets how background work is driven. Defaults to [`Background::Threads`].
    pub fn background(mut self, background: Background) -> PoolBuilder {
        self.background = background;
        self
    }

    /// Sets how many candidates [`Pool::reclaim`] examines before giving up on
    /// a page.
    pub fn reclaim_retries(mut self, retries: u32) -> PoolBuilder {
        self.reclaim_retries = retries;
        self
    }

    /// Constructs the pool, spawning its workers if required.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the name is empty or the
    /// retry count is zero, and [`AllocInitError::WorkerSpawn`] if a worker
    /// thread cannot be started.
    pub fn build(self) -> Result<Pool, AllocInitError> {
        if self.name.is_empty() {
            return Err(AllocInitError::InvalidConfig("pool name must not be empty"));
        }

        if self.reclaim_retries == 0 {
            return Err(AllocInitError::InvalidConfig(
                "reclaim retries must be non-zero",
            ));
        }

        let threads = self.background == Background::Threads;
        let (compact_tx, compact_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let (compactd, released) = if threads {
            (Waker::new(compact_tx), Waker::new(release_tx))
        } else {
            (Waker::manual(), Waker::manual())
        };

        debug!(
            "{}: created ({PAGE_SIZE}-byte pages, {CHUNK_SIZE}-byte chunks, {NCHUNKS} usable, {:?} background)",
            self.name, self.background
        );

        let shared = Arc::new(Shared {
            name: self.name,
            arena: Arena::new(),
            handles: HandleCache::new(),
            buckets: Buckets::new(),
            lru: Lru::new(),
            evictions: Evictions::new(),
            compact_queue: Mutex::new(VecDeque::new()),
            stale: Mutex::new(VecDeque::new()),
            source: self.source,
            stats: Stats::default(),
            compactd,
            released,
        });

        let mut pool = Pool {
            shared,
            evict: self.evict,
            reclaim_retries: self.reclaim_retries,
            workers: Vec::new(),
        };

        if threads {
            for (role, rx) in [(Role::Compact, compact_rx), (Role::Release, release_rx)] {
                let worker = worker::spawn(role, Arc::clone(&pool.shared), rx)
                    .map_err(AllocInitError::WorkerSpawn)?;
                pool.workers.push(worker);
            }
        }

        Ok(pool)
    }
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("name", &self.name)
            .field("evict", &self.evict.is_some())
            .field("source", &self.source)
            .field("background", &self.background)
            .field("reclaim_retries", &self.reclaim_retries)
            .finish()
    }
}

/// Access requested by [`Pool::map`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MapMode {
    /// The mapping may be read and written.
    ReadWrite,
    /// The mapping may only be read.
    ReadOnly,
    /// The mapping is meant to be written; previous contents are unspecified.
    WriteOnly,
}

/// A view of an allocation's bytes.
///
/// While a `Mapping` exists its handle is pinned: the allocation cannot be
/// moved, migrated, evicted or freed. Dropping the mapping unmaps it.
///
/// Inside an [`Evict`] callback, the victim is mapped under the pin already
/// held by the reclaim. Any other thread mapping the victim waits until the
/// reclaim lets go of it.
pub struct Mapping<'a> {
    entry: &'a HandleEntry,
    handle: Handle,
    ptr: NonNull<u8>,
    len: usize,
    mode: MapMode,
    owns_pin: bool,
}

impl Mapping<'_> {
    /// Returns the handle this mapping views.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Returns the access mode of this mapping.
    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Returns the bytes mutably, or `None` for a read-only mapping.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self.mode {
            MapMode::ReadOnly => None,
            // SAFETY: the handle is pinned, so the range is neither moved nor
            // freed, and no other mapping of it can exist. `self` is borrowed
            // mutably.
            MapMode::ReadWrite | MapMode::WriteOnly => {
                Some(unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
            }
        }
    }

    /// Unmaps the allocation.
    pub fn unmap(self) {}
}

impl Deref for Mapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the handle is pinned for the lifetime of `self`; see
        // `as_mut_slice`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        if self.owns_pin {
            self.entry.unpin();
        }
    }
}

impl fmt::Debug for Mapping<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("handle", &self.handle)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Where an allocation currently lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Location {
    /// The block holding the allocation.
    pub block: BlockId,
    /// The slot holding the allocation, or `None` if it is headless.
    pub buddy: Option<Buddy>,
    /// The byte offset of the allocation within the page.
    pub offset: usize,
    /// The requested size of the allocation, in bytes.
    pub len: usize,
}

/// A packed-page allocator.
///
/// For a discussion of the allocation strategy, see the [crate-level
/// documentation](crate).
pub struct Pool {
    pub(crate) shared: Arc<Shared>,
    pub(crate) evict: Option<Box<dyn Evict>>,
    pub(crate) reclaim_retries: u32,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Constructs a pool with default settings and no eviction callback.
    ///
    /// # Errors
    ///
    /// See [`PoolBuilder::build`].
    pub fn new(name: impl Into<String>) -> Result<Pool, AllocInitError> {
        Pool::builder(name).build()
    }

    /// Returns a builder for a pool called `name`.
    pub fn builder(name: impl Into<String>) -> PoolBuilder {
        PoolBuilder {
            name: name.into(),
            evict: None,
            source: Box::new(Global),
            background: Background::Threads,
            reclaim_retries: PoolBuilder::DEFAULT_RECLAIM_RETRIES,
        }
    }

    /// Returns the pool's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Allocates `size` bytes.
    ///
    /// If `may_block` is `true`, the pool may recycle a page still waiting to
    /// be released and the page source may wait for memory.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidSize`] if `size` is zero or larger than
    /// [`PAGE_SIZE`], and [`AllocError::OutOfMemory`] if no page or handle
    /// could be obtained. A failed allocation leaves the pool unchanged.
    pub fn alloc(&self, size: usize, may_block: bool) -> Result<Handle, AllocError> {
        self.shared.alloc(size, may_block)
    }

    /// Frees the allocation named by `handle`.
    ///
    /// If the page becomes empty it is released later by the release worker.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was already freed or was not issued by this pool.
    /// Freeing a handle that is mapped on the current thread deadlocks.
    pub fn free(&self, handle: Handle) {
        self.shared.free(handle)
    }

    /// Maps the allocation named by `handle`.
    ///
    /// Waits for any compaction, migration, eviction or other mapping of the
    /// allocation to finish, and marks the handle contended meanwhile so the
    /// compactor backs off.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was already freed or was not issued by this pool.
    /// Mapping a handle twice on the same thread deadlocks.
    pub fn map(&self, handle: Handle, mode: MapMode) -> Mapping<'_> {
        let shared = &*self.shared;
        let entry = shared.handles.entry(handle);

        let owns_pin = if shared.evictions.is_current(handle) {
            // The reclaim running this thread's callback holds the pin.
            false
        } else {
            entry.pin();
            true
        };

        let (block, slot) = shared.lock_owner(handle, entry, true);
        let (offset, len) = block.byte_range(slot);
        let ptr = block.page().byte_ptr(offset);
        drop(block);

        Mapping {
            entry,
            handle,
            ptr,
            len,
            mode,
            owns_pin,
        }
    }

    /// Unmaps `mapping`. Equivalent to dropping it.
    pub fn unmap(&self, mapping: Mapping<'_>) {
        mapping.unmap();
    }

    /// Returns the current location of the allocation named by `handle`.
    ///
    /// The location may change as soon as this returns.
    pub fn locate(&self, handle: Handle) -> Location {
        let shared = &*self.shared;
        let entry = shared.handles.entry(handle);
        let (block, slot) = shared.lock_owner(handle, entry, false);
        let (offset, len) = block.byte_range(slot);

        Location {
            block: block.id(),
            buddy: slot.buddy(),
            offset,
            len,
        }
    }

    /// Returns the ids of every block that is not waiting to be released.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.shared
            .arena
            .snapshot()
            .into_iter()
            .filter(|b| !b.flags().contains(BlockFlags::STALE))
            .map(|b| b.id())
            .collect()
    }

    /// Returns the number of pages held by the pool, including empty pages
    /// not yet released.
    pub fn pool_size(&self) -> u64 {
        self.shared.stats.pages.load(Ordering::Relaxed)
    }

    /// Returns the number of headless pages.
    pub fn headless_page_count(&self) -> u64 {
        self.shared.stats.headless.load(Ordering::Relaxed)
    }

    /// Returns the number of empty pages waiting for the release worker.
    pub fn stale_count(&self) -> u64 {
        self.shared.stats.stale.load(Ordering::Relaxed)
    }

    /// Returns the number of blocks whose reclaim could not be completed in
    /// place.
    pub fn orphan_count(&self) -> u64 {
        self.shared.stats.orphans.load(Ordering::Relaxed)
    }

    /// Returns the number of live handles.
    pub fn handle_count(&self) -> usize {
        self.shared.handles.live()
    }

    /// Drains the compaction queue on the calling thread.
    pub fn run_compaction(&self) {
        self.shared.compact_all();
    }

    /// Settles orphaned blocks and releases stale pages on the calling thread.
    pub fn run_release(&self) {
        self.shared.release_all();
    }

    /// Waits until all queued compaction and release work has completed.
    ///
    /// Work queued concurrently by other threads may or may not be included.
    pub fn flush(&self) {
        let shared = &*self.shared;
        loop {
            if shared.compactd.is_manual() {
                shared.compact_all();
                shared.release_all();
            } else {
                shared.compactd.flush();
                shared.released.flush();
            }

            let idle = shared.compact_queue.lock().is_empty()
                && shared.stale.lock().is_empty()
                && !shared.buckets.has_orphans();
            if idle || self.workers.iter().any(JoinHandle::is_finished) {
                return;
            }
        }
    }

    /// Checks the packing invariants of every block.
    ///
    /// # Panics
    ///
    /// Panics with a dump of the offending block if an invariant is violated.
    pub fn validate(&self) {
        let shared = &*self.shared;
        for block in shared.arena.snapshot() {
            let block = block.lock();

            if block.flags().contains(BlockFlags::STALE) {
                if block.live != 0 || block.refcount != 0 {
                    fatal!("{}: stale {} is in use: {block:?}", shared.name, block.id());
                }
                continue;
            }

            if let Err(violation) = block.check(block.is_headless()) {
                fatal!("{}: {}: {violation}: {block:?}", shared.name, block.id());
            }

            for handle in block.live_handles() {
                let (id, slot) = shared.handles.entry(handle).location();
                if id != block.id() || !block.holds(slot, handle) {
                    fatal!(
                        "{}: {handle:?} in {} decodes to {id} {slot:?}: {block:?}",
                        shared.name,
                        block.id()
                    );
                }
            }
        }
    }

    /// Destroys the pool.
    ///
    /// Pending compaction and release work is completed first.
    ///
    /// # Errors
    ///
    /// Returns the pool inside a [`DestroyError`] if it still holds pages.
    pub fn destroy(self) -> Result<(), DestroyError> {
        self.flush();

        let pages = self.pool_size();
        if pages != 0 {
            return Err(DestroyError { pages, pool: self });
        }

        debug!("{}: destroyed", self.shared.name);
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.compactd.shutdown();
        self.shared.released.shutdown();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("{}: worker thread panicked", self.shared.name);
            }
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("pages", &self.pool_size())
            .field("headless", &self.headless_page_count())
            .field("stale", &self.stale_count())
            .field("orphans", &self.orphan_count())
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}
