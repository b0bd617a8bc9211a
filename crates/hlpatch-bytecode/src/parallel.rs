//! Fan-out of independent per-entity work
//!
//! Work is split into contiguous chunks, one per worker thread. Each worker
//! maps only its own chunk and results come back in input order, so the
//! output never depends on the strategy chosen.

use std::panic;

/// How internal fan-out work is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Scoped worker threads; `threads == 0` uses the number of CPU cores
    Parallel {
        /// Worker count
        threads: usize,
    },
    /// Everything on the calling thread
    Sequential,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::Parallel { threads: 0 }
    }
}

impl ExecutionStrategy {
    /// Number of workers this strategy runs with
    pub fn worker_count(&self) -> usize {
        match *self {
            Self::Parallel { threads: 0 } => num_cpus::get(),
            Self::Parallel { threads } => threads,
            Self::Sequential => 1,
        }
    }

    /// Map `f` over `items`, preserving order
    pub fn map<'a, T, R, F>(&self, items: &'a [T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &'a T) -> R + Sync,
    {
        let workers = self.worker_count().min(items.len());
        if workers <= 1 {
            return items.iter().enumerate().map(|(i, item)| f(i, item)).collect();
        }

        let chunk_size = items.len().div_ceil(workers);
        let f = &f;
        let result = crossbeam::scope(|scope| {
            let handles: Vec<_> = items
                .chunks(chunk_size)
                .enumerate()
                .map(|(chunk, slice)| {
                    let base = chunk * chunk_size;
                    scope.spawn(move |_| {
                        slice
                            .iter()
                            .enumerate()
                            .map(|(i, item)| f(base + i, item))
                            .collect::<Vec<R>>()
                    })
                })
                .collect();

            let mut out = Vec::with_capacity(items.len());
            for handle in handles {
                match handle.join() {
                    Ok(part) => out.extend(part),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            out
        });

        match result {
            Ok(out) => out,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Map a fallible `f` over `items`, returning the first error in input
    /// order
    pub fn try_map<'a, T, R, E, F>(&self, items: &'a [T], f: F) -> Result<Vec<R>, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(usize, &'a T) -> Result<R, E> + Sync,
    {
        self.map(items, f).into_iter().collect()
    }
}
