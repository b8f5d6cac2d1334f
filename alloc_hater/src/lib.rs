//! A small library for ~~hating on~~ evaluating the correctness of
//! handle-based allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of
//! [`AllocatorOp`]s. Every allocation is painted with the id of the operation
//! that created it, and the paint is verified before the allocation is freed
//! and after every custom operation, which is where subjects move memory
//! around behind their handles.

use std::fmt::Debug;

use arbitrary::{Arbitrary, Unstructured};

/// Allocation sizes are limited to `2^MAX_SIZE_BITS` bytes.
const MAX_SIZE_BITS: u8 = 13;

/// A wrapper around an allocation size which implements `Arbitrary`.
///
/// Sizes are log-uniform, so small allocations dominate but large ones are
/// still generated. Zero-sized requests are included.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        let exp = u8::arbitrary(u)? % (MAX_SIZE_BITS + 1);
        let size = usize::arbitrary(u)? % (2_usize.pow(exp.into()) + 1);
        Ok(ArbSize(size))
    }
}

#[derive(Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Custom,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp<Op> {
    /// Allocate this many bytes.
    Alloc(usize),
    /// Free an outstanding allocation, chosen modulo the number outstanding.
    Dealloc(usize),
    /// A subject-specific operation.
    Custom(Op),
}

impl<'a, Op: Arbitrary<'a>> Arbitrary<'a> for AllocatorOp<Op> {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let op = match AllocatorOpTag::arbitrary(u)? {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Custom => AllocatorOp::Custom(Op::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type Op: for<'a> Arbitrary<'a> + Clone + Debug;
    type Handle: Copy;
    type AllocError;

    /// Allocates `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<Self::Handle, Self::AllocError>;

    /// Calls `f` with the bytes of `handle`, mutably.
    fn write(&mut self, handle: Self::Handle, f: &mut dyn FnMut(&mut [u8]));

    /// Calls `f` with the bytes of `handle`.
    fn read(&mut self, handle: Self::Handle, f: &mut dyn FnMut(&[u8]));

    /// Frees `handle`.
    fn deallocate(&mut self, handle: Self::Handle);

    fn handle_custom_op(&mut self, op: Self::Op) {
        // To silence the unused variable warning.
        drop(op);
    }
}

/// An outstanding allocation.
struct Allocation<H> {
    handle: H,
    size: usize,
    // The unique ID of the operation that allocated it.
    id: u64,
}

/// A list of outstanding allocations.
struct Allocations<H> {
    allocations: Vec<Allocation<H>>,
}

impl<H> Allocations<H> {
    fn new() -> Allocations<H> {
        Allocations {
            allocations: Vec::new(),
        }
    }

    fn push(&mut self, allocation: Allocation<H>) {
        self.allocations.push(allocation);
    }

    fn remove_modulo(&mut self, idx: usize) -> Option<Allocation<H>> {
        let len = self.allocations.len();
        (len != 0).then(|| self.allocations.swap_remove(idx % len))
    }
}

fn paint(bytes: &mut [u8], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in bytes.iter_mut().zip(id_bytes) {
        *byte = value;
    }
}

fn is_painted(bytes: &[u8], id: u64) -> bool {
    let id_bytes = id.to_le_bytes().into_iter().cycle();
    bytes.iter().zip(id_bytes).all(|(&byte, value)| byte == value)
}

impl<H: Copy> Allocation<H> {
    /// Verifies that the memory has neither been overwritten nor resized.
    fn verify<S: Subject<Handle = H>>(&self, subject: &mut S) -> bool {
        let mut ok = false;
        subject.read(self.handle, &mut |bytes| {
            ok = bytes.len() == self.size && is_painted(bytes, self.id);
        });
        ok
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed<Op> {
    pub completed: Vec<AllocatorOp<Op>>,
    /// The operation after which corruption was detected, or `None` if it was
    /// detected while freeing the remaining allocations.
    pub failed_op: Option<AllocatorOp<Op>>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed<S::Op>>
    where
        I: IntoIterator<Item = AllocatorOp<S::Op>>,
    {
        let mut completed = Vec::new();
        let mut allocations = Allocations::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            let ok = match op.clone() {
                AllocatorOp::Alloc(size) => {
                    let Ok(handle) = self.subject.allocate(size) else {
                        continue;
                    };

                    let mut sized = false;
                    self.subject.write(handle, &mut |bytes| {
                        sized = bytes.len() == size;
                        paint(bytes, op_id);
                    });

                    allocations.push(Allocation {
                        handle,
                        size,
                        id: op_id,
                    });
                    sized
                }

                AllocatorOp::Dealloc(raw_idx) => match allocations.remove_modulo(raw_idx) {
                    Some(a) => {
                        let ok = a.verify(&mut self.subject);
                        self.subject.deallocate(a.handle);
                        ok
                    }
                    None => continue,
                },

                AllocatorOp::Custom(custom) => {
                    self.subject.handle_custom_op(custom);
                    allocations
                        .allocations
                        .iter()
                        .all(|a| a.verify(&mut self.subject))
                }
            };

            if !ok {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                });
            }

            completed.push(op);
        }

        let mut ok = true;
        for a in allocations.allocations {
            ok &= a.verify(&mut self.subject);
            self.subject.deallocate(a.handle);
        }

        if !ok {
            return Err(Failed {
                completed,
                failed_op: None,
            });
        }

        Ok(())
    }
}
