//! # Worker Pool
//!
//! CPU-bound cryptographic steps are taken off the event loop in batches of
//! eight: each batch runs on the blocking thread pool while the async side
//! stays responsive. Output order matches input order.

use crate::error::PepError;

/// The unit of offload for batched CPU work.
pub const BATCH_SIZE: usize = 8;

/// Bounded-parallelism offload helper for CPU-bound work.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    batch_size: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool {
            batch_size: BATCH_SIZE,
        }
    }
}

impl WorkerPool {
    pub fn new() -> WorkerPool {
        WorkerPool::default()
    }

    /// Maps `f` over `items` in batches on the blocking pool, preserving
    /// order.
    pub async fn batched_map<T, U, F>(&self, items: Vec<T>, f: F) -> Result<Vec<U>, PepError>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + Clone + 'static,
    {
        let mut out = Vec::with_capacity(items.len());
        let mut iter = items.into_iter();
        loop {
            let batch: Vec<T> = iter.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let func = f.clone();
            let mapped = tokio::task::spawn_blocking(move || {
                batch.into_iter().map(func).collect::<Vec<U>>()
            })
            .await
            .map_err(|e| PepError::transient(format!("worker pool: {e}")))?;
            out.extend(mapped);
        }
        Ok(out)
    }

    /// Like `batched_map` for fallible work; the first error aborts.
    pub async fn batched_try_map<T, U, F>(&self, items: Vec<T>, f: F) -> Result<Vec<U>, PepError>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T) -> Result<U, PepError> + Send + Sync + Clone + 'static,
    {
        let results = self.batched_map(items, f).await?;
        results.into_iter().collect()
    }
}
