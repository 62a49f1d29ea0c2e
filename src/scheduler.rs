//! Explicit worker-pool handle for alignment jobs.
//!
//! The orchestrator never touches a global thread pool. Callers build one
//! [`Scheduler`] and pass it in, which keeps parallelism a caller decision
//! and makes tests deterministic with a single-threaded pool.

use rayon::ThreadPool;

use crate::error::{Error, Result};

/// Handle to the worker pool that executes bin-level alignment jobs and
/// per-sample recalibration jobs.
pub struct Scheduler {
    pool: ThreadPool,
}

impl Scheduler {
    /// Build a scheduler with a fixed number of worker threads.
    /// `num_threads = 0` lets rayon pick the hardware default.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;
        Ok(Scheduler { pool })
    }

    /// Run a closure inside the worker pool. Parallel iterators used inside
    /// the closure are executed on this pool's threads.
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    /// Number of worker threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}
