//! Page frames and the sources that supply them.
//!
//! A [`Pool`](crate::Pool) never allocates pages directly. It asks its
//! [`PageSource`] for a frame when no existing page can hold an allocation and
//! returns frames to it once they have been emptied and released. Two sources
//! are provided:
//!
//! - [`Global`] allocates frames from the global allocator without limit.
//! - [`Bounded`] allows a fixed number of outstanding frames, optionally
//!   waiting for one to be returned when the caller permits blocking.

use std::{
    alloc::{self, Layout},
    fmt,
    ptr::{self, NonNull},
    slice,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::geometry::{chunks_to_bytes, PAGE_SIZE, TOTAL_CHUNKS};

/// An owned, page-aligned frame of [`PAGE_SIZE`] bytes.
///
/// The frame is returned to the global allocator when the `Page` is dropped.
pub struct Page {
    ptr: NonNull<u8>,
}

// SAFETY: a `Page` exclusively owns its frame. Once a page belongs to a pool,
// accesses to disjoint byte ranges are coordinated by the pool's block locks
// and handle pins.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// The layout of every page frame.
    pub const LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
        Ok(layout) => layout,
        Err(_) => panic!("page size must be a power of two"),
    };

    /// Allocates a zeroed frame from the global allocator.
    ///
    /// Returns `None` if the global allocator fails.
    pub fn alloc() -> Option<Page> {
        // SAFETY: `LAYOUT` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(Self::LAYOUT) };
        NonNull::new(raw).map(|ptr| Page { ptr })
    }

    /// Returns the contents of the frame.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the frame is valid for `PAGE_SIZE` bytes and initialized on
        // allocation. Pages owned by a pool are never exposed by reference.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Returns the contents of the frame mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `self` is borrowed mutably.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Returns a pointer to the start of chunk `chunk`.
    ///
    /// The pointer carries the provenance of the whole frame.
    pub(crate) fn chunk_ptr(&self, chunk: usize) -> NonNull<u8> {
        assert!(chunk <= TOTAL_CHUNKS);
        self.byte_ptr(chunks_to_bytes(chunk))
    }

    /// Returns a pointer to byte `offset` of the frame.
    pub(crate) fn byte_ptr(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= PAGE_SIZE);
        // SAFETY: `offset` is at most one past the end of the frame.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    /// Copies the whole of `src` into `self`.
    ///
    /// # Safety
    ///
    /// No other party may be reading or writing either frame.
    pub(crate) unsafe fn copy_from(&self, src: &Page) {
        unsafe { ptr::copy_nonoverlapping(src.ptr.as_ptr(), self.ptr.as_ptr(), PAGE_SIZE) };
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: the frame was allocated in `Page::alloc` with `LAYOUT`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::LAYOUT) };
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("ptr", &self.ptr).finish()
    }
}

/// Types which supply the page frames backing a pool.
pub trait PageSource: Send + Sync + fmt::Debug {
    /// Obtains a frame, or `None` if none is available.
    ///
    /// If `may_block` is `true`, the source may wait for a frame to become
    /// available. Otherwise it must fail fast.
    fn alloc_page(&self, may_block: bool) -> Option<Page>;

    /// Returns a frame previously obtained from [`alloc_page`].
    ///
    /// [`alloc_page`]: PageSource::alloc_page
    fn free_page(&self, page: Page) {
        drop(page);
    }
}

impl<S: PageSource + ?Sized> PageSource for Arc<S> {
    fn alloc_page(&self, may_block: bool) -> Option<Page> {
        (**self).alloc_page(may_block)
    }

    fn free_page(&self, page: Page) {
        (**self).free_page(page)
    }
}

/// The global memory allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct Global;

impl PageSource for Global {
    fn alloc_page(&self, _may_block: bool) -> Option<Page> {
        Page::alloc()
    }
}

/// A page source that allows at most a fixed number of outstanding frames.
#[derive(Debug)]
pub struct Bounded {
    limit: usize,
    wait: Option<Duration>,
    outstanding: Mutex<usize>,
    returned: Condvar,
}

impl Bounded {
    /// Constructs a source that hands out at most `limit` frames at a time.
    ///
    /// Requests beyond the limit fail immediately.
    pub fn new(limit: usize) -> Bounded {
        Bounded {
            limit,
            wait: None,
            outstanding: Mutex::new(0),
            returned: Condvar::new(),
        }
    }

    /// Constructs a source like [`Bounded::new`], except that blocking
    /// requests beyond the limit wait up to `wait` for a frame to be returned.
    pub fn with_wait(limit: usize, wait: Duration) -> Bounded {
        Bounded {
            wait: Some(wait),
            ..Bounded::new(limit)
        }
    }

    /// Returns the maximum number of outstanding frames.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the number of frames currently handed out.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }
}

impl PageSource for Bounded {
    fn alloc_page(&self, may_block: bool) -> Option<Page> {
        let mut outstanding = self.outstanding.lock();

        if *outstanding >= self.limit {
            let wait = self.wait.filter(|_| may_block)?;
            let deadline = Instant::now() + wait;

            while *outstanding >= self.limit {
                if self
                    .returned
                    .wait_until(&mut outstanding, deadline)
                    .timed_out()
                    && *outstanding >= self.limit
                {
                    return None;
                }
            }
        }

        let page = Page::alloc()?;
        *outstanding += 1;
        Some(page)
    }

    fn free_page(&self, page: Page) {
        drop(page);

        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        self.returned.notify_one();
    }
}
