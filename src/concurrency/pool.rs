// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A small fixed-size worker pool for running application callbacks
//! (message-listener dispatch, tuning-reset drivers) off the reader
//! task so a slow callback cannot stall frame delivery on other
//! channels.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

/// Caps the number of application callbacks running concurrently for
/// a given [`crate::context::Context`]. Each dispatch still runs as
/// its own Tokio task; the semaphore only bounds how many may run at
/// once, the way a native thread pool bounds worker threads.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Runs `job` on the pool, waiting for a free slot first. Spawn
    /// failures are not possible (the future is driven to completion
    /// on the current task after acquiring a permit); callers that
    /// need fire-and-forget dispatch should `tokio::spawn` the call to
    /// `run` itself.
    pub async fn run<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let Ok(permit) = permits.acquire_owned().await else {
            warn!("worker pool semaphore closed; running job inline");
            job().await;
            return;
        };
        tokio::spawn(async move {
            job().await;
            drop(permit);
        });
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn runs_jobs_and_releases_permits() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            pool.run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.available_permits(), 2);
    }
}
