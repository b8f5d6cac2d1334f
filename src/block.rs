//! Blocks and their headers.
//!
//! A block is one page frame plus the [`Header`] describing the buddies
//! packed into it. Blocks live in an [`Arena`] and are named by [`BlockId`];
//! the bucket lists, the compaction queue, the stale list, the LRU and every
//! handle refer to blocks by id rather than by pointer.
//!
//! Each block carries an atomic flags word. The `LOCKED` bit is a spin lock
//! guarding the header, and is only ever held through a [`LockedBlock`]. The
//! remaining bits record state that other parties may test without taking the
//! lock.

use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::{
    geometry::{chunks_to_bytes, Buddy, BUDDIES, HEADER_CHUNKS, NCHUNKS, TOTAL_CHUNKS},
    handle::Handle,
    page::Page,
};

/// Identifies a block (one page) within a pool.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId(u32);

impl BlockId {
    /// Returns the block's index in the pool's arena.
    ///
    /// Indices of released blocks are reused.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_raw(raw: u32) -> BlockId {
        BlockId(raw)
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}", self.0)
    }
}

/// Where within a block an allocation lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Slot {
    Buddy(Buddy),
    Headless,
}

impl Slot {
    /// Index into the header's per-slot arrays.
    pub(crate) fn index(self) -> usize {
        match self {
            Slot::Buddy(b) => b.index(),
            Slot::Headless => 0,
        }
    }

    pub(crate) fn buddy(self) -> Option<Buddy> {
        match self {
            Slot::Buddy(b) => Some(b),
            Slot::Headless => None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct BlockFlags: u32 {
        /// The header lock.
        const LOCKED = 1 << 0;
        /// The page holds a single allocation and no header chunks.
        const HEADLESS = 1 << 1;
        /// The block is empty and waiting on the stale list.
        const STALE = 1 << 2;
        /// The block is on the compaction queue.
        const NEEDS_COMPACTING = 1 << 3;
        /// The block has been isolated for relocation.
        const ISOLATED = 1 << 4;
        /// The block is being reclaimed.
        const RECLAIM = 1 << 5;
        /// A reclaim could not relock the block; the release worker settles it.
        const ORPHANED = 1 << 6;
    }
}

/// Which pool-wide collection a block is on.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ListPos {
    Unlisted,
    Bucket(usize),
    Compact,
    Stale,
}

/// Order in which an empty slot is chosen for a new buddy.
const PLACEMENT_ORDER: [Buddy; BUDDIES] = [Buddy::First, Buddy::Last, Buddy::Second, Buddy::Third];

/// Per-page metadata.
///
/// Headless blocks use only the first entry of the per-slot arrays and keep
/// all chunk counts at zero.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) page: Option<Page>,
    /// Live buddies plus one per holder (queue entry, reclaim, isolation).
    pub(crate) refcount: u32,
    pub(crate) live: u8,
    pub(crate) chunks: [u16; BUDDIES],
    pub(crate) start: [u16; BUDDIES],
    /// Requested allocation sizes, in bytes.
    pub(crate) sizes: [u16; BUDDIES],
    pub(crate) handles: [Option<Handle>; BUDDIES],
    pub(crate) list: ListPos,
    pub(crate) lru: Option<u64>,
    /// Handles pinned by an isolation.
    pub(crate) isolated: [Option<Handle>; BUDDIES],
}

impl Header {
    fn new(page: Page) -> Header {
        Header {
            page: Some(page),
            refcount: 0,
            live: 0,
            chunks: [0; BUDDIES],
            start: [0; BUDDIES],
            sizes: [0; BUDDIES],
            handles: [None; BUDDIES],
            list: ListPos::Unlisted,
            lru: None,
            isolated: [None; BUDDIES],
        }
    }

    pub(crate) fn page(&self) -> &Page {
        match &self.page {
            Some(p) => p,
            None => fatal!("block header has no page: {:?}", self),
        }
    }

    pub(crate) fn is_occupied(&self, buddy: Buddy) -> bool {
        self.chunks[buddy.index()] != 0
    }

    pub(crate) fn len_of(&self, buddy: Buddy) -> usize {
        self.chunks[buddy.index()].into()
    }

    pub(crate) fn start_of(&self, buddy: Buddy) -> usize {
        self.start[buddy.index()].into()
    }

    pub(crate) fn end_of(&self, buddy: Buddy) -> usize {
        self.start_of(buddy) + self.len_of(buddy)
    }

    /// Returns the first chunk past the nearest occupied buddy before `buddy`.
    pub(crate) fn floor(&self, buddy: Buddy) -> usize {
        Buddy::ALL[..buddy.index()]
            .iter()
            .rev()
            .find(|b| self.is_occupied(**b))
            .map_or(HEADER_CHUNKS, |b| self.end_of(*b))
    }

    /// Returns the first chunk of the nearest occupied buddy after `buddy`.
    pub(crate) fn ceiling(&self, buddy: Buddy) -> usize {
        Buddy::ALL[buddy.index() + 1..]
            .iter()
            .find(|b| self.is_occupied(**b))
            .map_or(TOTAL_CHUNKS, |b| self.start_of(*b))
    }

    /// Returns the number of chunks an empty slot could grow into.
    pub(crate) fn run(&self, buddy: Buddy) -> Option<usize> {
        (!self.is_occupied(buddy)).then(|| self.ceiling(buddy).saturating_sub(self.floor(buddy)))
    }

    /// Returns the size of the largest allocation, in chunks, that still fits.
    pub(crate) fn free_chunks(&self) -> usize {
        Buddy::ALL
            .into_iter()
            .filter_map(|b| self.run(b))
            .max()
            .unwrap_or(0)
    }

    /// Chooses the slot for an allocation of `chunks` chunks.
    pub(crate) fn fit(&self, chunks: usize) -> Option<Buddy> {
        PLACEMENT_ORDER
            .into_iter()
            .find(|b| self.run(*b).is_some_and(|run| run >= chunks))
    }

    pub(crate) fn used_chunks(&self) -> usize {
        self.chunks.iter().map(|&c| usize::from(c)).sum()
    }

    pub(crate) fn live_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.handles.iter().flatten().copied()
    }

    /// Returns the slot holding `handle`, if any.
    pub(crate) fn slot_of(&self, handle: Handle, headless: bool) -> Option<Slot> {
        let index = self.handles.iter().position(|h| *h == Some(handle))?;
        if headless {
            return (index == 0).then_some(Slot::Headless);
        }

        Buddy::from_index(index).map(Slot::Buddy)
    }

    /// Returns the byte offset and requested length of the allocation in `slot`.
    pub(crate) fn byte_range(&self, slot: Slot) -> (usize, usize) {
        let len = self.sizes[slot.index()].into();
        match slot {
            Slot::Buddy(b) => (chunks_to_bytes(self.start_of(b)), len),
            Slot::Headless => (0, len),
        }
    }

    /// Checks the packing invariants, returning a description of the first
    /// violation found.
    pub(crate) fn check(&self, headless: bool) -> Result<(), &'static str> {
        let live = self.live_handles().count();
        if live != usize::from(self.live) {
            return Err("live count disagrees with occupied slots");
        }

        if (self.refcount as usize) < live {
            return Err("refcount is below the live count");
        }

        if headless {
            if self.used_chunks() != 0 || self.handles[1..].iter().any(Option::is_some) {
                return Err("headless block has buddies");
            }
            return Ok(());
        }

        for b in Buddy::ALL {
            if self.is_occupied(b) != self.handles[b.index()].is_some() {
                return Err("slot length and handle disagree");
            }
        }

        if self.used_chunks() > NCHUNKS {
            return Err("buddies exceed the usable chunks");
        }

        if self.is_occupied(Buddy::First) && self.start_of(Buddy::First) != HEADER_CHUNKS {
            return Err("FIRST does not start after the header");
        }

        if self.is_occupied(Buddy::Last) && self.end_of(Buddy::Last) != TOTAL_CHUNKS {
            return Err("LAST does not end at the page boundary");
        }

        let mut prev_end = HEADER_CHUNKS;
        for b in Buddy::ALL.into_iter().filter(|b| self.is_occupied(*b)) {
            if self.start_of(b) < prev_end {
                return Err("buddies overlap or are out of order");
            }
            prev_end = self.end_of(b);
        }

        if prev_end > TOTAL_CHUNKS {
            return Err("buddy extends past the page");
        }

        Ok(())
    }
}

/// A page and its metadata.
pub(crate) struct Block {
    id: BlockId,
    flags: AtomicU32,
    header: UnsafeCell<Header>,
}

// SAFETY: the header is only accessed through a `LockedBlock`, which holds
// the LOCKED bit for its whole lifetime.
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Sets `flags`, returning the previous flags.
    pub(crate) fn set_flags(&self, flags: BlockFlags) -> BlockFlags {
        BlockFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clears `flags`, returning the previous flags.
    pub(crate) fn clear_flags(&self, flags: BlockFlags) -> BlockFlags {
        BlockFlags::from_bits_retain(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    pub(crate) fn try_lock(self: &Arc<Self>) -> Option<LockedBlock> {
        if self.flags().contains(BlockFlags::LOCKED) {
            return None;
        }

        let prev = self.set_flags(BlockFlags::LOCKED);
        (!prev.contains(BlockFlags::LOCKED)).then(|| LockedBlock {
            block: Arc::clone(self),
        })
    }

    pub(crate) fn lock(self: &Arc<Self>) -> LockedBlock {
        let mut spins = 0;
        loop {
            if let Some(locked) = self.try_lock() {
                return locked;
            }
            crate::relax(&mut spins);
        }
    }
}

/// A block whose header lock is held.
///
/// The lock is released on drop.
pub(crate) struct LockedBlock {
    block: Arc<Block>,
}

impl LockedBlock {
    pub(crate) fn id(&self) -> BlockId {
        self.block.id
    }

    pub(crate) fn flags(&self) -> BlockFlags {
        self.block.flags()
    }

    pub(crate) fn set_flags(&self, flags: BlockFlags) -> BlockFlags {
        self.block.set_flags(flags)
    }

    pub(crate) fn clear_flags(&self, flags: BlockFlags) -> BlockFlags {
        self.block.clear_flags(flags)
    }

    pub(crate) fn is_headless(&self) -> bool {
        self.flags().contains(BlockFlags::HEADLESS)
    }

    /// Returns `true` if `slot` holds `handle`.
    pub(crate) fn holds(&self, slot: Slot, handle: Handle) -> bool {
        (slot == Slot::Headless) == self.is_headless()
            && self.handles[slot.index()] == Some(handle)
    }

    pub(crate) fn chunk_ptr(&self, chunk: usize) -> NonNull<u8> {
        self.page().chunk_ptr(chunk)
    }

    /// Takes a reference on behalf of a holder.
    pub(crate) fn get(&mut self) {
        self.refcount += 1;
    }

    /// Drops one reference.
    pub(crate) fn put(&mut self) {
        match self.refcount.checked_sub(1) {
            Some(r) => self.refcount = r,
            None => fatal!("{}: refcount underflow: {:?}", self.id(), **self),
        }
    }

    /// Records a new buddy of `chunks` chunks holding `size` bytes in `buddy`.
    pub(crate) fn place(&mut self, buddy: Buddy, chunks: usize, size: usize, handle: Handle) {
        if !self.run(buddy).is_some_and(|run| run >= chunks) {
            fatal!(
                "{}: {buddy:?} cannot hold {chunks} chunks: {:?}",
                self.id(),
                **self
            );
        }

        let start = match buddy {
            Buddy::Last => TOTAL_CHUNKS - chunks,
            _ => self.floor(buddy),
        };

        let i = buddy.index();
        // Cannot truncate: all values are bounded by the page size.
        self.chunks[i] = chunks as u16;
        self.start[i] = start as u16;
        self.sizes[i] = size as u16;
        self.handles[i] = Some(handle);
        self.live += 1;
        self.get();
    }

    /// Records the single allocation of a headless block.
    pub(crate) fn occupy_headless(&mut self, handle: Handle, size: usize) {
        // Cannot truncate: size is at most a page.
        self.sizes[0] = size as u16;
        self.handles[0] = Some(handle);
        self.live = 1;
        self.refcount = 1;
    }

    /// Empties `slot`, dropping the reference it held, and returns its handle.
    pub(crate) fn vacate(&mut self, slot: Slot) -> Handle {
        let i = slot.index();
        let Some(handle) = self.handles[i].take() else {
            fatal!("{}: vacating empty {slot:?}: {:?}", self.id(), **self);
        };

        self.chunks[i] = 0;
        self.start[i] = 0;
        self.sizes[i] = 0;
        self.live -= 1;
        self.put();
        handle
    }

    /// Moves the metadata of buddy `from` to buddy `to`, starting at chunk
    /// `start`. The caller moves the bytes.
    pub(crate) fn shift(&mut self, from: Buddy, to: Buddy, start: usize) {
        let (f, t) = (from.index(), to.index());
        if from != to && self.is_occupied(to) {
            fatal!("{}: shifting {from:?} onto occupied {to:?}: {:?}", self.id(), **self);
        }

        let (chunks, size, handle) = (self.chunks[f], self.sizes[f], self.handles[f]);
        self.chunks[f] = 0;
        self.start[f] = 0;
        self.sizes[f] = 0;
        self.handles[f] = None;

        self.chunks[t] = chunks;
        // Cannot truncate: start is a chunk index.
        self.start[t] = start as u16;
        self.sizes[t] = size;
        self.handles[t] = handle;
    }

    /// Takes over every buddy and reference of `old`, leaving it empty.
    ///
    /// The caller copies the page contents.
    pub(crate) fn adopt(&mut self, old: &mut LockedBlock) {
        self.refcount = old.refcount;
        self.live = old.live;
        self.chunks = old.chunks;
        self.start = old.start;
        self.sizes = old.sizes;
        self.handles = old.handles;

        old.refcount = 0;
        old.live = 0;
        old.chunks = [0; BUDDIES];
        old.start = [0; BUDDIES];
        old.sizes = [0; BUDDIES];
        old.handles = [None; BUDDIES];
    }
}

impl Deref for LockedBlock {
    type Target = Header;

    fn deref(&self) -> &Header {
        // SAFETY: the LOCKED bit is held for the lifetime of `self`.
        unsafe { &*self.block.header.get() }
    }
}

impl DerefMut for LockedBlock {
    fn deref_mut(&mut self) -> &mut Header {
        // SAFETY: the LOCKED bit is held for the lifetime of `self`, and `self`
        // is borrowed mutably.
        unsafe { &mut *self.block.header.get() }
    }
}

impl Drop for LockedBlock {
    fn drop(&mut self) {
        self.block.clear_flags(BlockFlags::LOCKED);
    }
}

impl fmt::Debug for LockedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedBlock")
            .field("id", &self.id())
            .field("flags", &self.flags())
            .field("header", &**self)
            .finish()
    }
}

/// All blocks of a pool, indexed by id.
pub(crate) struct Arena {
    slots: RwLock<ArenaSlots>,
}

struct ArenaSlots {
    blocks: Vec<Option<Arc<Block>>>,
    free: Vec<u32>,
}

impl Arena {
    pub(crate) fn new() -> Arena {
        Arena {
            slots: RwLock::new(ArenaSlots {
                blocks: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Adds a block over `page`, returned locked.
    pub(crate) fn insert_locked(&self, page: Page, flags: BlockFlags) -> LockedBlock {
        let mut slots = self.slots.write();
        let raw = match slots.free.pop() {
            Some(raw) => raw,
            None => {
                let raw = u32::try_from(slots.blocks.len())
                    .unwrap_or_else(|_| fatal!("block arena exhausted"));
                slots.blocks.push(None);
                raw
            }
        };

        let block = Arc::new(Block {
            id: BlockId(raw),
            flags: AtomicU32::new((flags | BlockFlags::LOCKED).bits()),
            header: UnsafeCell::new(Header::new(page)),
        });
        slots.blocks[raw as usize] = Some(Arc::clone(&block));

        LockedBlock { block }
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<Arc<Block>> {
        self.slots.read().blocks.get(id.index())?.clone()
    }

    pub(crate) fn remove(&self, id: BlockId) -> Option<Arc<Block>> {
        let mut slots = self.slots.write();
        let block = slots.blocks.get_mut(id.index())?.take()?;
        slots.free.push(id.0);
        Some(block)
    }

    /// Returns every block currently in the arena.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Block>> {
        self.slots.read().blocks.iter().flatten().cloned().collect()
    }
}
