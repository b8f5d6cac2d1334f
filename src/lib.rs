//! A packed-page allocator for compressed blobs.
//!
//! `acid_fold` stores small, variable-size, opaque byte strings (typically the
//! output of a compressor) by packing up to four of them, called *buddies*,
//! into each page. Pages are carved into 16-byte chunks; the first few chunks
//! are reserved for the page header and the rest hold the buddies. Blobs too
//! large to share a page are stored *headless*, one per page.
//!
//! Callers never see addresses. Every allocation is named by a [`Handle`],
//! which the pool resolves to the allocation's current location on every
//! [`map`](Pool::map). This indirection lets the pool move buddies around:
//!
//! - A background compaction worker squeezes gaps out of partially-emptied
//!   pages and migrates stragglers into fuller pages.
//! - [`reclaim`](Pool::reclaim) evicts the least-recently-used pages through a
//!   caller-supplied [`Evict`] callback.
//! - With the `relocate` feature, the host may isolate a page and move its
//!   contents to a different frame ([`Relocatable`]).
//!
//! Emptied pages are not returned synchronously; a second background worker
//! hands them back to the [`PageSource`].
//!
//! ## Example
//!
//! ```
//! use acid_fold::{MapMode, Pool};
//!
//! let pool = Pool::new("zram0")?;
//!
//! let handle = pool.alloc(100, false)?;
//! {
//!     let mut mapping = pool.map(handle, MapMode::WriteOnly);
//!     mapping.as_mut_slice().unwrap().fill(0xA5);
//! }
//!
//! assert!(pool.map(handle, MapMode::ReadOnly).iter().all(|&b| b == 0xA5));
//! assert_eq!(pool.pool_size(), 1);
//!
//! pool.free(handle);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![doc(html_root_url = "https://docs.rs/acid_fold/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]

/// Reports a broken allocator invariant, then panics.
///
/// Invariant violations indicate memory corruption or misuse (double free, a
/// handle that decodes to a block which does not hold it). Continuing would
/// hand out overlapping memory, so they are never turned into `Err` values.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
        panic!($($arg)+)
    }};
}

mod block;
mod buckets;
mod compact;
pub mod geometry;
mod handle;
pub mod page;
mod pool;
mod reclaim;
mod release;
#[cfg(feature = "relocate")]
mod relocate;
mod worker;

#[cfg(test)]
mod tests;

pub use crate::{
    block::BlockId,
    geometry::Buddy,
    handle::Handle,
    page::{Bounded, Global, Page, PageSource},
    pool::{Background, Location, MapMode, Mapping, Pool, PoolBuilder},
    reclaim::Evict,
};

#[cfg(feature = "relocate")]
#[cfg_attr(docs_rs, doc(cfg(feature = "relocate")))]
pub use crate::relocate::{MigrateError, Migrated, RelocateError, Relocatable};

/// The error type for pool constructors.
#[derive(Debug, thiserror::Error)]
pub enum AllocInitError {
    /// The configuration of the pool is invalid.
    ///
    /// The variant contains a description of the offending parameter.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    /// A background worker thread could not be started.
    #[error("failed to spawn pool worker thread")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// size.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum AllocError {
    /// The requested size was zero or larger than a page.
    #[error("invalid allocation size: {0} bytes")]
    InvalidSize(usize),

    /// No page or handle could be obtained.
    #[error("out of memory")]
    OutOfMemory,
}

/// The error type for [`Pool::reclaim`].
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ReclaimError {
    /// The pool was built without an eviction callback.
    #[error("pool has no eviction callback")]
    NotConfigured,

    /// The LRU list is empty.
    #[error("no pages to reclaim")]
    NoCandidates,

    /// Every candidate examined was busy or refused eviction.
    #[error("reclaim retries exhausted")]
    RetriesExhausted,
}

/// Returned by an [`Evict`] callback that could not write back a handle.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, thiserror::Error)]
#[error("eviction failed")]
pub struct EvictError;

/// Returned by [`Pool::destroy`] when pages are still allocated.
///
/// The pool is handed back so the caller may free the remaining handles and
/// try again.
#[derive(Debug, thiserror::Error)]
#[error("pool still holds {pages} pages")]
pub struct DestroyError {
    /// The number of pages the pool still holds.
    pub pages: u64,
    pool: Pool,
}

impl DestroyError {
    /// Recovers the pool that could not be destroyed.
    pub fn into_pool(self) -> Pool {
        self.pool
    }
}

/// Backs off while spinning on a contended lock or pin bit.
fn relax(spins: &mut u32) {
    if *spins < 64 {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}
