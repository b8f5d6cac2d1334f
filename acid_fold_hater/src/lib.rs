use acid_fold::{
    AllocError, AllocInitError, Background, Bounded, Handle, MapMode, PageSource, Pool,
};
use alloc_hater::Subject;

/// Pool maintenance steps interleaved with allocations.
#[derive(Clone, Debug, arbitrary::Arbitrary)]
pub enum PoolOp {
    Compact,
    Release,
    Flush,
    Validate,
}

pub struct PoolSubject(Pool);

impl PoolSubject {
    /// A manually driven pool over the global allocator.
    pub fn new() -> Result<Self, AllocInitError> {
        PoolSubject::with_source(Background::Manual, acid_fold::Global)
    }

    /// A manually driven pool that may hold at most `limit` pages.
    pub fn bounded(limit: usize) -> Result<Self, AllocInitError> {
        PoolSubject::with_source(Background::Manual, Bounded::new(limit))
    }

    pub fn with_source(
        background: Background,
        source: impl PageSource + 'static,
    ) -> Result<Self, AllocInitError> {
        let pool = Pool::builder("hater")
            .background(background)
            .page_source(source)
            .build()?;
        Ok(PoolSubject(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.0
    }
}

impl Subject for PoolSubject {
    type Op = PoolOp;
    type Handle = Handle;
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<Handle, AllocError> {
        self.0.alloc(size, false)
    }

    fn write(&mut self, handle: Handle, f: &mut dyn FnMut(&mut [u8])) {
        let mut mapping = self.0.map(handle, MapMode::WriteOnly);
        if let Some(bytes) = mapping.as_mut_slice() {
            f(bytes);
        }
    }

    fn read(&mut self, handle: Handle, f: &mut dyn FnMut(&[u8])) {
        let mapping = self.0.map(handle, MapMode::ReadOnly);
        f(&mapping[..]);
    }

    fn deallocate(&mut self, handle: Handle) {
        self.0.free(handle);
    }

    fn handle_custom_op(&mut self, op: PoolOp) {
        match op {
            PoolOp::Compact => self.0.run_compaction(),
            PoolOp::Release => self.0.run_release(),
            PoolOp::Flush => self.0.flush(),
            PoolOp::Validate => self.0.validate(),
        }
    }
}
