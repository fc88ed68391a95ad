//! Fixed-ceiling worker pool with blocking backpressure.
//!
//! # Responsibilities
//! - Enforce `max_workers` via a semaphore (one permit per running worker)
//! - Attach per-worker context (tracing span) at submission
//! - Contain worker panics so one connection cannot poison the pool
//! - Drain and hard-cancel workers at shutdown

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::protocol::ConnectionId;

/// Error type for pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,
}

/// A reserved worker slot.
///
/// When dropped, the slot is released back to the pool. Moving it into the
/// spawned worker keeps the slot busy for exactly the worker's lifetime, even
/// if the worker panics or is aborted.
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

/// Runs connection workers, at most `max_workers` at a time.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    max_workers: usize,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Reserve a slot, waiting until one is free.
    pub async fn reserve(&self) -> Result<PoolSlot, PoolError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tracing::debug!(
            available_slots = self.slots.available_permits(),
            max_workers = self.max_workers,
            "Worker slot reserved"
        );
        Ok(PoolSlot { _permit: permit })
    }

    /// Run `worker` in a reserved slot.
    ///
    /// Fails, dropping `worker` unstarted, if the pool shut down after the
    /// slot was reserved.
    pub async fn spawn<F>(&self, slot: PoolSlot, connection_id: ConnectionId, worker: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("worker", connection_id = %connection_id);
        let task = async move {
            let _slot = slot;
            if let Err(panic) = AssertUnwindSafe(worker).catch_unwind().await {
                tracing::error!(panic = %panic_message(&*panic), "Worker panicked");
            }
        }
        .instrument(span);

        let mut tasks = self.tasks.lock().await;
        if self.slots.is_closed() {
            return Err(PoolError::Closed);
        }
        // Reap finished workers so the set does not grow with connection churn.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
        Ok(())
    }

    /// Reserve a slot and run `worker` in it.
    pub async fn submit<F>(&self, connection_id: ConnectionId, worker: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slot = self.reserve().await?;
        self.spawn(slot, connection_id, worker).await
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.max_workers.saturating_sub(self.slots.available_permits())
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Refuse new work, give running workers `grace` to exit, then abort them.
    pub async fn shutdown(&self, grace: Duration) {
        self.slots.close();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), "Workers still running after grace period, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        tracing::info!("Worker pool stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
