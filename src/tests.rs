#![cfg(test)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    block::BlockId,
    geometry::{Buddy, HEADER_SIZE, MAX_PACKED_SIZE, PAGE_SIZE},
    AllocError, AllocInitError, Background, Bounded, EvictError, Handle, MapMode, Page, Pool,
    ReclaimError,
};

#[cfg(feature = "relocate")]
use crate::{RelocateError, Relocatable};

fn manual_pool() -> Pool {
    Pool::builder("test")
        .background(Background::Manual)
        .build()
        .unwrap()
}

/// Fills an allocation with the bytes of `id`, repeated.
fn paint(pool: &Pool, handle: Handle, id: u32) {
    let mut mapping = pool.map(handle, MapMode::WriteOnly);
    let pattern = id.to_le_bytes();
    for (i, b) in mapping.as_mut_slice().unwrap().iter_mut().enumerate() {
        *b = pattern[i % pattern.len()];
    }
}

fn is_painted(pool: &Pool, handle: Handle, id: u32) -> bool {
    let mapping = pool.map(handle, MapMode::ReadOnly);
    let pattern = id.to_le_bytes();
    mapping
        .iter()
        .enumerate()
        .all(|(i, &b)| b == pattern[i % pattern.len()])
}

// Property tests =============================================================

#[derive(Clone, Debug)]
struct PoolParams {
    background: Background,
}

impl Arbitrary for PoolParams {
    fn arbitrary(g: &mut Gen) -> Self {
        PoolParams {
            background: *g
                .choose(&[Background::Threads, Background::Manual])
                .unwrap(),
        }
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
    Compact,
    Release,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate `len` bytes.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
    /// Drain the compaction queue on the test thread.
    Compact,
    /// Release stale pages on the test thread.
    Release,
}

/// Allocation sizes are drawn from `1..=2^exp` with `exp` uniform, so small
/// buddies are common but headless pages still show up.
fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % 13;
    1 + usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Free,
                AllocatorOpTag::Free,
                AllocatorOpTag::Compact,
                AllocatorOpTag::Release,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
            AllocatorOpTag::Compact => AllocatorOp::Compact,
            AllocatorOpTag::Release => AllocatorOp::Release,
        }
    }
}

type OpId = u32;

struct Allocation {
    id: OpId,
    handle: Handle,
    len: usize,
}

trait Prop {
    /// Examines the pool after each operation.
    fn post_op(pool: &Pool) -> bool {
        let _ = pool;
        true
    }

    /// Examines an allocation before it is freed.
    fn pre_free(pool: &Pool, allocation: &Allocation) -> bool {
        let _ = (pool, allocation);
        true
    }

    /// Examines the pool once every allocation has been freed.
    fn finish(pool: &Pool) -> bool {
        let _ = pool;
        true
    }
}

struct PoolChecker<P: Prop> {
    pool: Pool,
    allocations: Vec<Allocation>,
    num_ops: u32,
    prop: std::marker::PhantomData<P>,
}

impl<P: Prop> PoolChecker<P> {
    fn new(params: PoolParams, capacity: usize) -> Result<Self, AllocInitError> {
        Ok(PoolChecker {
            pool: Pool::builder("qc").background(params.background).build()?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
            prop: std::marker::PhantomData,
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                let Ok(handle) = self.pool.alloc(len, false) else {
                    return false;
                };

                if self.pool.map(handle, MapMode::ReadOnly).len() != len {
                    return false;
                }

                paint(&self.pool, handle, op_id);
                self.allocations.push(Allocation {
                    id: op_id,
                    handle,
                    len,
                });
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);
                if !P::pre_free(&self.pool, &a) {
                    return false;
                }

                self.pool.free(a.handle);
            }

            AllocatorOp::Compact => self.pool.run_compaction(),
            AllocatorOp::Release => self.pool.run_release(),
        }

        P::post_op(&self.pool)
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        self.pool.flush();
        for a in std::mem::take(&mut self.allocations) {
            if !P::pre_free(&self.pool, &a) {
                return false;
            }
            self.pool.free(a.handle);
        }

        self.pool.flush();
        P::finish(&self.pool)
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 10;

/// Allocations never overlap, and survive compaction with their contents.
struct MutuallyExclusive;

impl Prop for MutuallyExclusive {
    fn pre_free(pool: &Pool, allocation: &Allocation) -> bool {
        let len = pool.map(allocation.handle, MapMode::ReadOnly).len();
        len == allocation.len && is_painted(pool, allocation.handle, allocation.id)
    }
}

/// Every block satisfies the packing invariants between operations.
struct PackingInvariants;

impl Prop for PackingInvariants {
    fn post_op(pool: &Pool) -> bool {
        pool.validate();
        true
    }
}

/// Freeing everything returns every page and handle.
struct NoLeak;

impl Prop for NoLeak {
    fn finish(pool: &Pool) -> bool {
        pool.pool_size() == 0
            && pool.headless_page_count() == 0
            && pool.stale_count() == 0
            && pool.handle_count() == 0
            && pool.block_ids().is_empty()
    }
}

fn check<P: Prop>(params: PoolParams, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: PoolChecker<P> = PoolChecker::new(params, ops.capacity()).unwrap();
    checker.run(ops)
}

#[test]
fn allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive> as fn(_, _) -> bool);
}

#[test]
fn packing_invariants_hold() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<PackingInvariants> as fn(_, _) -> bool);
}

#[test]
fn freeing_everything_releases_every_page() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<NoLeak> as fn(_, _) -> bool);
}

// Packing ====================================================================

#[test]
fn four_small_buddies_share_a_page() {
    let pool = manual_pool();
    let handles: Vec<Handle> = (0..4).map(|_| pool.alloc(100, false).unwrap()).collect();

    let locations: Vec<_> = handles.iter().map(|&h| pool.locate(h)).collect();
    assert!(locations.iter().all(|l| l.block == locations[0].block));
    assert_eq!(
        locations.iter().map(|l| l.buddy).collect::<Vec<_>>(),
        [
            Some(Buddy::First),
            Some(Buddy::Last),
            Some(Buddy::Second),
            Some(Buddy::Third)
        ]
    );
    assert_eq!(locations[0].offset, HEADER_SIZE);
    assert_eq!(locations[1].offset, PAGE_SIZE - 112);
    assert_eq!(pool.pool_size(), 1);

    // A fifth buddy needs a new page.
    let fifth = pool.alloc(100, false).unwrap();
    assert_ne!(pool.locate(fifth).block, locations[0].block);
    assert_eq!(pool.pool_size(), 2);
    pool.validate();
}

#[test]
fn large_allocations_are_headless() {
    let pool = manual_pool();

    let headless = pool.alloc(MAX_PACKED_SIZE + 1, false).unwrap();
    let location = pool.locate(headless);
    assert_eq!(location.buddy, None);
    assert_eq!(location.offset, 0);
    assert_eq!(location.len, MAX_PACKED_SIZE + 1);
    assert_eq!(pool.headless_page_count(), 1);

    let packed = pool.alloc(MAX_PACKED_SIZE, false).unwrap();
    assert_eq!(pool.locate(packed).buddy, Some(Buddy::First));
    assert_eq!(pool.headless_page_count(), 1);
    assert_eq!(pool.pool_size(), 2);

    // Headless pages are released synchronously.
    pool.free(headless);
    assert_eq!(pool.pool_size(), 1);
    assert_eq!(pool.headless_page_count(), 0);

    let whole_page = pool.alloc(PAGE_SIZE, false).unwrap();
    paint(&pool, whole_page, 0xDEAD_BEEF);
    assert!(is_painted(&pool, whole_page, 0xDEAD_BEEF));
    pool.validate();
}

#[test]
fn invalid_sizes_are_rejected() {
    let pool = manual_pool();
    assert_eq!(pool.alloc(0, false), Err(AllocError::InvalidSize(0)));
    assert_eq!(
        pool.alloc(PAGE_SIZE + 1, true),
        Err(AllocError::InvalidSize(PAGE_SIZE + 1))
    );
    assert_eq!(pool.pool_size(), 0);
    assert_eq!(pool.handle_count(), 0);
}

#[test]
fn exhausted_page_source_fails_cleanly() {
    let pool = Pool::builder("bounded")
        .background(Background::Manual)
        .page_source(Bounded::new(1))
        .build()
        .unwrap();

    let a = pool.alloc(3000, false).unwrap();
    assert_eq!(pool.alloc(3000, false), Err(AllocError::OutOfMemory));
    assert_eq!(pool.handle_count(), 1);
    assert_eq!(pool.pool_size(), 1);

    // Still room for a small buddy in the existing page.
    let b = pool.alloc(500, false).unwrap();
    assert_eq!(pool.locate(a).block, pool.locate(b).block);
    pool.validate();
}

#[test]
fn read_only_mappings_are_not_writable() {
    let pool = manual_pool();
    let h = pool.alloc(64, false).unwrap();

    let mut mapping = pool.map(h, MapMode::ReadOnly);
    assert_eq!(mapping.mode(), MapMode::ReadOnly);
    assert_eq!(mapping.handle(), h);
    assert!(mapping.as_mut_slice().is_none());
    pool.unmap(mapping);

    let mut mapping = pool.map(h, MapMode::ReadWrite);
    mapping.as_mut_slice().unwrap()[0] = 7;
    drop(mapping);
    assert_eq!(pool.map(h, MapMode::ReadOnly)[0], 7);
}

// Compaction and release =====================================================

#[test]
fn compaction_slides_survivor_to_header() {
    let pool = manual_pool();
    let handles: Vec<Handle> = (0..4).map(|_| pool.alloc(100, false).unwrap()).collect();
    for (id, &h) in handles.iter().enumerate() {
        paint(&pool, h, id as u32);
    }

    let survivor = handles[3];
    assert_eq!(pool.locate(survivor).buddy, Some(Buddy::Third));
    assert_eq!(pool.locate(survivor).offset, HEADER_SIZE + 2 * 112);

    for &h in &handles[..3] {
        pool.free(h);
    }
    pool.run_compaction();

    let location = pool.locate(survivor);
    assert_eq!(location.buddy, Some(Buddy::First));
    assert_eq!(location.offset, HEADER_SIZE);
    assert!(is_painted(&pool, survivor, 3));
    pool.validate();
}

#[test]
fn compaction_leaves_small_gaps() {
    let pool = manual_pool();
    // FIRST is 2 chunks, SECOND and THIRD are 7 chunks each.
    let first = pool.alloc(32, false).unwrap();
    let last = pool.alloc(100, false).unwrap();
    let second = pool.alloc(100, false).unwrap();
    let third = pool.alloc(100, false).unwrap();
    assert_eq!(pool.locate(second).buddy, Some(Buddy::Second));

    pool.free(first);
    pool.run_compaction();

    // A 2-chunk gap is below the threshold, so SECOND stays put.
    let location = pool.locate(second);
    assert_eq!(location.buddy, Some(Buddy::Second));
    assert_eq!(location.offset, HEADER_SIZE + 32);
    assert_eq!(pool.locate(third).buddy, Some(Buddy::Third));
    assert_eq!(pool.locate(last).buddy, Some(Buddy::Last));
    pool.validate();
}

#[test]
fn sparse_blocks_migrate_into_tight_fits() {
    let pool = manual_pool();

    // Fill block A with four 7-chunk buddies; three are freed later, leaving
    // a sparse block.
    let a: Vec<Handle> = (0..4).map(|_| pool.alloc(100, false).unwrap()).collect();
    let block_a = pool.locate(a[0]).block;

    // Block B takes a 227-chunk buddy and two 7-chunk buddies, leaving a
    // 7-chunk hole for THIRD.
    let b_first = pool.alloc(227 * 16, false).unwrap();
    let block_b = pool.locate(b_first).block;
    assert_ne!(block_a, block_b);
    let b_rest: Vec<Handle> = (0..2).map(|_| pool.alloc(100, false).unwrap()).collect();
    assert!(b_rest.iter().all(|&h| pool.locate(h).block == block_b));

    paint(&pool, a[3], 0xA3);
    for &h in &a[..3] {
        pool.free(h);
    }
    pool.run_compaction();

    // A's survivor moved into B's 7-chunk hole and A went stale.
    assert_eq!(pool.locate(a[3]).block, block_b);
    assert!(is_painted(&pool, a[3], 0xA3));
    assert_eq!(pool.stale_count(), 1);
    pool.run_release();
    assert_eq!(pool.pool_size(), 1);
    pool.validate();
}

#[test]
fn empty_pages_are_released_by_the_worker() {
    let pool = manual_pool();
    let h = pool.alloc(100, false).unwrap();
    pool.free(h);

    // Not released until the worker runs.
    assert_eq!(pool.pool_size(), 1);
    assert_eq!(pool.stale_count(), 1);
    assert!(pool.block_ids().is_empty());

    pool.run_release();
    assert_eq!(pool.pool_size(), 0);
    assert_eq!(pool.stale_count(), 0);
}

#[test]
fn blocking_allocations_recycle_stale_pages() {
    let pool = Pool::builder("recycle")
        .background(Background::Manual)
        .page_source(Bounded::new(1))
        .build()
        .unwrap();

    let h = pool.alloc(3000, false).unwrap();
    pool.free(h);
    assert_eq!(pool.stale_count(), 1);

    // Non-blocking allocations may not wait for the release worker.
    assert_eq!(pool.alloc(3000, false), Err(AllocError::OutOfMemory));

    let h = pool.alloc(3000, true).unwrap();
    assert_eq!(pool.stale_count(), 0);
    assert_eq!(pool.pool_size(), 1);
    pool.free(h);
}

#[test]
fn background_workers_compact_and_release() {
    let pool = Pool::new("threads").unwrap();
    let handles: Vec<Handle> = (0..4).map(|_| pool.alloc(100, false).unwrap()).collect();
    paint(&pool, handles[3], 3);

    for &h in &handles[..3] {
        pool.free(h);
    }
    pool.flush();
    assert_eq!(pool.locate(handles[3]).offset, HEADER_SIZE);
    assert!(is_painted(&pool, handles[3], 3));

    pool.free(handles[3]);
    pool.flush();
    assert_eq!(pool.pool_size(), 0);
    pool.destroy().unwrap();
}

// Reclaim ====================================================================

type Evicted = Arc<Mutex<Vec<(Handle, Vec<u8>)>>>;

fn evicting_pool(background: Background) -> (Pool, Evicted) {
    let evicted: Evicted = Arc::default();
    let sink = Arc::clone(&evicted);

    let pool = Pool::builder("reclaim")
        .background(background)
        .evict_with(move |pool: &Pool, handle| {
            let data = pool.map(handle, MapMode::ReadOnly).to_vec();
            pool.free(handle);
            sink.lock().push((handle, data));
            Ok(())
        })
        .build()
        .unwrap();

    (pool, evicted)
}

#[test]
fn reclaim_evicts_least_recently_used_pages() {
    let (pool, evicted) = evicting_pool(Background::Manual);

    // 2000 bytes is 125 chunks, so each allocation gets its own page.
    let handles: Vec<Handle> = (0..3).map(|_| pool.alloc(2000, false).unwrap()).collect();
    for (id, &h) in handles.iter().enumerate() {
        paint(&pool, h, id as u32);
    }
    assert_eq!(pool.pool_size(), 3);

    assert_eq!(pool.reclaim(2), Ok(2));

    let evicted = evicted.lock();
    assert_eq!(
        evicted.iter().map(|(h, _)| *h).collect::<Vec<_>>(),
        handles[..2]
    );
    for (id, (_, data)) in evicted.iter().enumerate() {
        let pattern = (id as u32).to_le_bytes();
        assert_eq!(data.len(), 2000);
        assert!(data.iter().enumerate().all(|(i, &b)| b == pattern[i % 4]));
    }

    pool.run_release();
    assert_eq!(pool.pool_size(), 1);
    assert_eq!(pool.handle_count(), 1);
    assert!(is_painted(&pool, handles[2], 2));
    pool.validate();
}

#[test]
fn reclaim_evicts_every_buddy_of_a_page() {
    let (pool, evicted) = evicting_pool(Background::Manual);
    let handles: Vec<Handle> = (0..4).map(|_| pool.alloc(100, false).unwrap()).collect();

    assert_eq!(pool.reclaim(1), Ok(1));

    // THIRD, SECOND, LAST, then FIRST.
    let order: Vec<Handle> = evicted.lock().iter().map(|(h, _)| *h).collect();
    assert_eq!(order, [handles[3], handles[2], handles[1], handles[0]]);
    assert_eq!(pool.handle_count(), 0);

    pool.run_release();
    assert_eq!(pool.pool_size(), 0);
}

#[test]
fn reclaim_frees_headless_pages_immediately() {
    let (pool, evicted) = evicting_pool(Background::Manual);
    let h = pool.alloc(PAGE_SIZE, false).unwrap();

    assert_eq!(pool.reclaim(4), Ok(1));
    assert_eq!(evicted.lock().len(), 1);
    assert_eq!(pool.pool_size(), 0);
    assert_eq!(pool.headless_page_count(), 0);
    assert_eq!(evicted.lock()[0].0, h);
}

#[test]
fn reclaim_without_callback_is_not_configured() {
    let pool = manual_pool();
    pool.alloc(100, false).unwrap();
    assert_eq!(pool.reclaim(1), Err(ReclaimError::NotConfigured));
}

#[test]
fn reclaim_of_empty_pool_has_no_candidates() {
    let (pool, _) = evicting_pool(Background::Manual);
    assert_eq!(pool.reclaim(1), Err(ReclaimError::NoCandidates));
    assert_eq!(pool.reclaim(0), Ok(0));
}

#[test]
fn reclaim_gives_up_when_eviction_fails() {
    let pool = Pool::builder("failing")
        .background(Background::Manual)
        .reclaim_retries(3)
        .evict_with(|_: &Pool, _| Err(EvictError))
        .build()
        .unwrap();

    let handles: Vec<Handle> = (0..2).map(|_| pool.alloc(100, false).unwrap()).collect();
    paint(&pool, handles[0], 1);

    assert_eq!(pool.reclaim(1), Err(ReclaimError::RetriesExhausted));
    assert_eq!(pool.handle_count(), 2);
    assert_eq!(pool.pool_size(), 1);
    assert!(is_painted(&pool, handles[0], 1));
    pool.validate();

    // The page is back in circulation.
    let third = pool.alloc(100, false).unwrap();
    assert_eq!(pool.locate(third).block, pool.locate(handles[0]).block);
}

#[test]
fn reclaim_skips_mapped_pages() {
    let (pool, evicted) = evicting_pool(Background::Manual);
    let busy = pool.alloc(2000, false).unwrap();
    let idle = pool.alloc(2000, false).unwrap();

    let mapping = pool.map(busy, MapMode::ReadOnly);
    assert_eq!(pool.reclaim(1), Ok(1));
    drop(mapping);

    assert_eq!(evicted.lock()[0].0, idle);
    assert!(pool.map(busy, MapMode::ReadOnly).len() == 2000);
}

#[test]
fn eviction_victims_cannot_be_mapped_by_other_threads() {
    let (victim_tx, victim_rx) = crossbeam_channel::bounded::<Handle>(1);
    let mapped = Arc::new(AtomicBool::new(false));
    let mapped_during_eviction = Arc::new(AtomicBool::new(false));

    let pool = {
        let mapped = Arc::clone(&mapped);
        let mapped_during_eviction = Arc::clone(&mapped_during_eviction);
        Pool::builder("exclusive")
            .background(Background::Manual)
            .reclaim_retries(1)
            .evict_with(move |pool: &Pool, handle| {
                // The callback itself may map its victim.
                assert_eq!(pool.map(handle, MapMode::ReadOnly).len(), 2000);

                victim_tx.send(handle).unwrap();
                thread::sleep(Duration::from_millis(50));
                mapped_during_eviction.store(mapped.load(Ordering::SeqCst), Ordering::SeqCst);
                Err(EvictError)
            })
            .build()
            .unwrap()
    };

    let h = pool.alloc(2000, false).unwrap();
    paint(&pool, h, 7);

    thread::scope(|s| {
        s.spawn(|| {
            let h = victim_rx.recv().unwrap();
            let mapping = pool.map(h, MapMode::ReadOnly);
            mapped.store(true, Ordering::SeqCst);
            assert_eq!(mapping.len(), 2000);
        });

        assert_eq!(pool.reclaim(1), Err(ReclaimError::RetriesExhausted));
    });

    assert!(!mapped_during_eviction.load(Ordering::SeqCst));
    assert!(mapped.load(Ordering::SeqCst));
    assert!(is_painted(&pool, h, 7));
    pool.validate();
}

#[test]
fn reclaim_races_owner_free() {
    const ROUNDS: u32 = 200;

    let pool = Pool::builder("racing")
        .background(Background::Manual)
        .evict_with(|_: &Pool, _| Err(EvictError))
        .build()
        .unwrap();

    for _ in 0..ROUNDS {
        let handles: Vec<Handle> = (0..4).map(|_| pool.alloc(100, false).unwrap()).collect();

        thread::scope(|s| {
            s.spawn(|| {
                let _ = pool.reclaim(1);
            });
            s.spawn(|| {
                for &h in &handles {
                    pool.free(h);
                }
            });
        });

        pool.flush();
        pool.validate();
        assert_eq!(pool.handle_count(), 0);
        assert_eq!(pool.pool_size(), 0);
    }
}

#[test]
fn reclaim_orphans_blocks_it_cannot_relock() {
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let holder: Arc<Mutex<Option<thread::JoinHandle<()>>>> = Arc::default();

    let pool = {
        let holder = Arc::clone(&holder);
        Pool::builder("orphans")
            .background(Background::Manual)
            .evict_with(move |pool: &Pool, handle| {
                let id = pool.locate(handle).block;
                pool.free(handle);

                // Hold the block's lock until the test lets go of it.
                let shared = Arc::clone(&pool.shared);
                let release_rx = release_rx.clone();
                let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
                *holder.lock() = Some(thread::spawn(move || {
                    let block = shared.arena.get(id).unwrap();
                    let _locked = block.lock();
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }));
                locked_rx.recv().unwrap();
                Ok(())
            })
            .build()
            .unwrap()
    };

    pool.alloc(100, false).unwrap();
    assert_eq!(pool.reclaim(1), Ok(1));
    assert_eq!(pool.orphan_count(), 1);
    assert_eq!(pool.handle_count(), 0);
    assert_eq!(pool.pool_size(), 1);

    release_tx.send(()).unwrap();
    holder.lock().take().unwrap().join().unwrap();

    pool.run_release();
    assert_eq!(pool.orphan_count(), 0);
    assert_eq!(pool.stale_count(), 0);
    assert_eq!(pool.pool_size(), 0);
    assert!(pool.block_ids().is_empty());
}

#[test]
fn evicted_chunks_can_be_allocated_again() {
    let evicted: Arc<Mutex<Vec<Handle>>> = Arc::default();
    let sink = Arc::clone(&evicted);

    let pool = Pool::builder("full")
        .background(Background::Manual)
        .page_source(Bounded::new(1))
        .evict_with(move |pool: &Pool, handle| {
            pool.free(handle);
            sink.lock().push(handle);
            Ok(())
        })
        .build()
        .unwrap();

    let first = pool.alloc(MAX_PACKED_SIZE, false).unwrap();
    assert_eq!(pool.alloc(100, false), Err(AllocError::OutOfMemory));

    assert_eq!(pool.reclaim(1), Ok(1));
    assert_eq!(*evicted.lock(), [first]);
    pool.run_release();
    assert_eq!(pool.pool_size(), 0);

    let second = pool.alloc(MAX_PACKED_SIZE, false).unwrap();
    assert_eq!(pool.locate(second).buddy, Some(Buddy::First));
    let third = pool.alloc(100, true);
    assert_eq!(third, Err(AllocError::OutOfMemory));
    assert_eq!(pool.pool_size(), 1);
    pool.validate();
}

// Relocation =================================================================

#[cfg(feature = "relocate")]
#[test]
fn migration_survives_concurrent_free() {
    let pool = manual_pool();
    let a = pool.alloc(100, false).unwrap();
    let b = pool.alloc(200, false).unwrap();
    paint(&pool, b, 0xB);
    let old = pool.locate(a).block;
    assert_eq!(pool.locate(b).block, old);

    pool.isolate(old).unwrap();
    thread::scope(|s| {
        s.spawn(|| pool.free(a));
    });

    let migrated = pool.migrate(old, Page::alloc().unwrap()).unwrap();
    assert_ne!(migrated.block, old);
    assert_eq!(pool.locate(b).block, migrated.block);
    assert!(is_painted(&pool, b, 0xB));
    assert_eq!(
        &migrated.old_page.as_bytes()[pool.locate(b).offset..][..4],
        &0xB_u32.to_le_bytes()
    );
    assert_eq!(pool.handle_count(), 1);
    assert_eq!(pool.pool_size(), 1);
    pool.validate();

    pool.free(b);
    pool.flush();
    assert_eq!(pool.pool_size(), 0);
}

#[cfg(feature = "relocate")]
#[test]
fn isolation_state_is_checked() {
    let pool = manual_pool();
    let a = pool.alloc(100, false).unwrap();
    let id = pool.locate(a).block;

    assert_eq!(
        pool.isolate(BlockId::from_raw(1000)),
        Err(RelocateError::NoSuchBlock)
    );
    assert_eq!(pool.unisolate(id), Err(RelocateError::NotIsolated));
    assert_eq!(
        pool.migrate(id, Page::alloc().unwrap()).unwrap_err().kind,
        RelocateError::NotIsolated
    );

    let mapping = pool.map(a, MapMode::ReadOnly);
    assert_eq!(pool.isolate(id), Err(RelocateError::Busy));
    drop(mapping);

    pool.isolate(id).unwrap();
    assert_eq!(pool.isolate(id), Err(RelocateError::Busy));
    pool.unisolate(id).unwrap();

    // The block is usable again.
    let b = pool.alloc(100, false).unwrap();
    assert_eq!(pool.locate(b).block, id);
    pool.validate();
}

#[cfg(feature = "relocate")]
#[test]
fn migrating_an_emptied_block_releases_it() {
    use crate::PageSource;

    let pool = manual_pool();
    let h = pool.alloc(PAGE_SIZE, false).unwrap();
    let id = pool.locate(h).block;

    pool.isolate(id).unwrap();
    pool.free(h);
    assert_eq!(pool.handle_count(), 1);

    let source = Bounded::new(1);
    let new_page = source.alloc_page(false).unwrap();
    let err = pool.migrate(id, new_page).unwrap_err();
    assert_eq!(err.kind, RelocateError::Released);
    assert_eq!(pool.handle_count(), 0);
    assert_eq!(pool.pool_size(), 0);

    // The frame comes back to the caller.
    source.free_page(err.into_page());
    assert_eq!(source.outstanding(), 0);
}

#[cfg(feature = "relocate")]
#[test]
fn unisolate_destroys_handles_freed_while_isolated() {
    let pool = manual_pool();
    let a = pool.alloc(100, false).unwrap();
    let b = pool.alloc(100, false).unwrap();
    paint(&pool, b, 0xB);
    let id = pool.locate(a).block;

    pool.isolate(id).unwrap();
    pool.free(a);
    assert_eq!(pool.handle_count(), 2);

    pool.unisolate(id).unwrap();
    assert_eq!(pool.handle_count(), 1);
    assert!(is_painted(&pool, b, 0xB));
    pool.validate();

    pool.free(b);
    pool.flush();
    assert_eq!(pool.handle_count(), 0);
    assert_eq!(pool.pool_size(), 0);
}

#[cfg(feature = "relocate")]
#[test]
fn relocation_races_free() {
    const ROUNDS: u32 = 200;

    let pool = manual_pool();
    for round in 0..ROUNDS {
        let handles: Vec<Handle> = (0..4).map(|_| pool.alloc(100, false).unwrap()).collect();
        for (i, &h) in handles.iter().enumerate() {
            paint(&pool, h, round * 4 + i as u32);
        }
        let id = pool.locate(handles[0]).block;
        let (doomed, kept) = handles.split_at(2);

        thread::scope(|s| {
            s.spawn(|| {
                for &h in doomed {
                    pool.free(h);
                }
            });
            s.spawn(|| {
                if pool.isolate(id).is_err() {
                    return;
                }

                if round % 2 == 0 {
                    let migrated = pool.migrate(id, Page::alloc().unwrap()).unwrap();
                    assert_ne!(migrated.block, id);
                } else {
                    pool.unisolate(id).unwrap();
                }
            });
        });

        pool.validate();
        for (i, &h) in kept.iter().enumerate() {
            assert!(is_painted(&pool, h, round * 4 + 2 + i as u32));
            pool.free(h);
        }

        pool.flush();
        pool.validate();
        assert_eq!(pool.handle_count(), 0);
        assert_eq!(pool.pool_size(), 0);
    }
}

// Lifecycle ==================================================================

#[test]
fn invalid_configurations_are_rejected() {
    assert!(matches!(
        Pool::new(""),
        Err(AllocInitError::InvalidConfig(_))
    ));
    assert!(matches!(
        Pool::builder("zero").reclaim_retries(0).build(),
        Err(AllocInitError::InvalidConfig(_))
    ));
}

#[test]
fn destroy_refuses_non_empty_pool() {
    let pool = manual_pool();
    let h = pool.alloc(100, false).unwrap();

    let err = pool.destroy().unwrap_err();
    assert_eq!(err.pages, 1);

    let pool = err.into_pool();
    pool.free(h);
    pool.destroy().unwrap();
}

#[test]
#[should_panic]
fn double_free_is_fatal() {
    let pool = manual_pool();
    let h = pool.alloc(100, false).unwrap();
    pool.free(h);
    pool.free(h);
}

#[test]
fn concurrent_alloc_map_free() {
    const THREADS: u32 = 4;
    const ROUNDS: u32 = 300;

    let pool = Pool::new("stress").unwrap();

    thread::scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            s.spawn(move || {
                let mut g = Gen::new(1500);

                let mut live = Vec::new();
                for round in 0..ROUNDS {
                    let id = t * ROUNDS + round;
                    let len = 1 + usize::arbitrary(&mut g) % 1500;
                    let h = pool.alloc(len, false).unwrap();
                    paint(pool, h, id);
                    live.push((h, id));

                    if u8::arbitrary(&mut g) % 3 != 0 && !live.is_empty() {
                        let (h, id) = live.swap_remove(usize::arbitrary(&mut g) % live.len());
                        assert!(is_painted(pool, h, id));
                        pool.free(h);
                    }
                }

                for (h, id) in live {
                    assert!(is_painted(pool, h, id));
                    pool.free(h);
                }
            });
        }
    });

    pool.flush();
    pool.validate();
    assert_eq!(pool.handle_count(), 0);
    assert_eq!(pool.pool_size(), 0);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
