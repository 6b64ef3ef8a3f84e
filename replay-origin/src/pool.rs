// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::sync::OwnedSemaphorePermit;

/// Default cap on concurrently served connections.
pub const DEFAULT_WORKER_LIMIT: usize = 256;

/// Bounded worker capacity. Each accepted connection takes one permit for
/// the lifetime of its serve loop; the acceptor waits when the pool is at
/// its cap. `join` waits until every worker has finished by taking the
/// whole capacity back.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> WorkerPool {
        let limit = limit.clamp(1, Semaphore::MAX_PERMITS);
        WorkerPool {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reserve a worker slot. `None` only if the pool was torn down.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Wait for every outstanding worker to finish.
    pub async fn join(&self) {
        let count = u32::try_from(self.limit).unwrap_or(u32::MAX);
        let _ = self.permits.clone().acquire_many_owned(count).await;
    }
}

/// Cooperative shutdown: one writer flips the flag, every loop observes
/// it at its natural waking point.
pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|set| *set).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_caps_concurrency_and_join_waits() {
        let pool = WorkerPool::new(2);
        let first = pool.reserve().await.unwrap();
        let second = pool.reserve().await.unwrap();

        // The third reservation has to wait for a free slot.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.reserve()).await;
        assert!(blocked.is_err());

        drop(first);
        let third = pool.reserve().await.unwrap();

        // join only completes once everything is released.
        let join_blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.join()).await;
        assert!(join_blocked.is_err());
        drop(second);
        drop(third);
        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let (handle, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_set());
        let mut waiter = shutdown.clone();
        let waited = tokio::spawn(async move { waiter.wait().await });
        handle.trigger();
        tokio::time::timeout(Duration::from_secs(1), waited)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_set());
    }
}
