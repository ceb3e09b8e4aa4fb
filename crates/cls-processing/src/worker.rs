//! Bounded worker pool shared by the per-channel stages

use cls_core::{ClsError, ClsResult};
use rayon::ThreadPoolBuilder;
use std::sync::{Arc, Mutex, MutexGuard};

/// Fixed-size rayon pool, cheap to clone
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<rayon::ThreadPool>,
    threads: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> ClsResult<Self> {
        if threads == 0 {
            return Err(ClsError::WorkerPool {
                reason: "worker pool needs at least one thread".to_string(),
            });
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("cls-worker-{}", i))
            .build()
            .map_err(|e| ClsError::WorkerPool { reason: e.to_string() })?;

        tracing::debug!(threads, "worker pool created");
        Ok(Self { pool: Arc::new(pool), threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `op` inside the pool so parallel iterators use its threads
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("threads", &self.threads).finish()
    }
}

/// One reusable unit per worker thread, each behind its own mutex
pub struct UnitPool<T> {
    units: Vec<Mutex<T>>,
}

impl<T: Send> UnitPool<T> {
    pub fn new(units: Vec<T>) -> ClsResult<Self> {
        if units.is_empty() {
            return Err(ClsError::WorkerPool {
                reason: "unit pool cannot be empty".to_string(),
            });
        }
        Ok(Self { units: units.into_iter().map(Mutex::new).collect() })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Lock the unit belonging to the calling worker thread
    pub fn acquire(&self) -> MutexGuard<'_, T> {
        let index = rayon::current_thread_index().unwrap_or(0) % self.units.len();
        self.units[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to every unit, e.g. to clear state
    pub fn for_each_mut(&self, mut f: impl FnMut(&mut T)) {
        for unit in &self.units {
            let mut guard = unit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard);
        }
    }
}
