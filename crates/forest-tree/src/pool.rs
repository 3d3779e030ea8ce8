//! C8: thread pool.
//!
//! A fixed-size worker pool built on `rayon::ThreadPool` (already a
//! direct dependency of the teacher's tree crate). Each worker owns a
//! thread-local "desk": an RNG reseeded per tree from the tree's seed
//! XOR the worker id, and scratch buffers that persist across the
//! trees a given OS thread ends up growing, so repeated allocation is
//! avoided on the hot path (spec §4.8, §9).

use std::cell::RefCell;

use forest_core::{Float, ForestError};
use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::SeedableRng;

use crate::threshold::ThresholdScratch;

/// Per-worker scratch bundle lent out for the duration of one tree's
/// growth.
pub struct Desk<T: Float> {
    pub rng: ChaCha8Rng,
    pub scratch: ThresholdScratch<T>,
}

fn with_desk<T: Float, R>(tree_seed: u64, f: impl FnOnce(&mut Desk<T>) -> R) -> R {
    thread_local! {
        static SCRATCH: RefCell<Option<Box<dyn std::any::Any>>> = RefCell::new(None);
    }
    let worker_id = rayon::current_thread_index().unwrap_or(0);
    let seed = tree_seed ^ (worker_id as u64);

    SCRATCH.with(|cell| {
        let mut slot = cell.borrow_mut();
        let boxed = slot
            .take()
            .and_then(|b| b.downcast::<ThresholdScratch<T>>().ok())
            .unwrap_or_else(|| Box::new(ThresholdScratch::<T>::new()));
        let mut desk = Desk { rng: ChaCha8Rng::seed_from_u64(seed), scratch: *boxed };
        let result = f(&mut desk);
        *slot = Some(Box::new(desk.scratch));
        result
    })
}

/// A fixed-size pool executing one job per tree (spec §4.8, §5: "one
/// tree per worker").
pub struct Pool {
    inner: rayon::ThreadPool,
}

impl Pool {
    pub fn new(n_threads: usize) -> Result<Self, ForestError> {
        if n_threads == 0 {
            return Err(ForestError::Unsupported("n_threads must be >= 1".into()));
        }
        let inner = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| ForestError::Internal(format!("failed to build thread pool: {e}")))?;
        Ok(Pool { inner })
    }

    /// Run `n_trees` independent jobs, each given its tree index and a
    /// worker-local desk seeded deterministically from `forest_seed`
    /// (spec §9: "per-tree seeds derived deterministically
    /// `seed + tree_index + 1`"). A panicking or failing job fails the
    /// whole `fit` (spec §5 failure isolation: other trees still run to
    /// completion, but the overall result is an error).
    pub fn run_per_tree<T, F, Out>(
        &self,
        n_trees: usize,
        forest_seed: u64,
        job: F,
    ) -> Result<Vec<Out>, ForestError>
    where
        T: Float,
        Out: Send,
        F: Fn(usize, &mut Desk<T>) -> Result<Out, ForestError> + Sync,
    {
        use rayon::prelude::*;
        self.inner.install(|| {
            (0..n_trees)
                .into_par_iter()
                .map(|tree_index| {
                    let tree_seed = forest_seed.wrapping_add(tree_index as u64).wrapping_add(1);
                    with_desk(tree_seed, |desk| job(tree_index, desk))
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_threads() {
        assert!(Pool::new(0).is_err());
    }

    #[test]
    fn runs_one_job_per_tree_and_preserves_order() {
        let pool = Pool::new(2).unwrap();
        let results: Vec<usize> = pool
            .run_per_tree::<f64, _, usize>(5, 42, |tree_index, _desk: &mut Desk<f64>| Ok(tree_index))
            .unwrap();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn propagates_job_failure() {
        let pool = Pool::new(2).unwrap();
        let result = pool.run_per_tree::<f64, _, usize>(3, 1, |tree_index, _desk: &mut Desk<f64>| {
            if tree_index == 1 {
                Err(ForestError::Internal("boom".into()))
            } else {
                Ok(tree_index)
            }
        });
        assert!(result.is_err());
    }
}
