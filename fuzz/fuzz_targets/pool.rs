#![no_main]
use acid_fold_hater::{PoolOp, PoolSubject};
use alloc_hater::AllocatorOp;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|ops: Vec<AllocatorOp<PoolOp>>| {
    let pool = PoolSubject::new().unwrap();

    let mut eval = alloc_hater::Evaluator::new(pool);
    eval.evaluate(ops).unwrap();

    let pool = eval.into_subject();
    pool.pool().flush();
    assert_eq!(pool.pool().pool_size(), 0);
});
