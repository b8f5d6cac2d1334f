#![no_main]
use acid_fold_hater::{PoolOp, PoolSubject};
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

const MAX_PAGES: usize = 64;

#[derive(Clone, Debug)]
struct Args {
    pages: usize,
    ops: Vec<AllocatorOp<PoolOp>>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let pages = usize::arbitrary(un)? % MAX_PAGES;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { pages, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { pages, ops } = args;

    let pool = match PoolSubject::bounded(pages) {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(pool);
    eval.evaluate(ops).unwrap();
});
