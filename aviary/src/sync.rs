//! Named shared queues and deadline-aware locks.
//!
//! Both registries hand out process-wide instances: the first `get(name)`
//! creates, subsequent calls return the same instance.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use dashmap::DashMap;
use faststr::FastStr;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedMutexGuard};

use crate::{
    error::{Error, Result},
    request::Request,
    value::Value,
};

/// An unbounded multi-producer multi-consumer queue whose `pop` honours
/// the request deadline.
pub struct SharedQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> SharedQueue<T> {
    pub fn new() -> Self {
        SharedQueue {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Waits for an item for at most `request.remain()`.
    pub async fn pop(&self, request: &Request) -> Result<T> {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return Ok(item);
            }
            if request.expired() {
                return Err(Error::deadline());
            }
            request.bound(notified).await?;
        }
    }

    /// Waits for an item for at most `limit`; `None` on timeout. Meant for
    /// consumers that are not themselves running under a request.
    pub async fn pop_for(&self, limit: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        SharedQueue::new()
    }
}

/// A mutex whose acquisition is bounded by the request deadline and whose
/// token releases on drop.
pub struct DeadlineLock {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl DeadlineLock {
    pub fn new() -> Self {
        DeadlineLock {
            inner: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub async fn acquire(&self, request: &Request) -> Result<LockToken> {
        let guard = request.bound(self.inner.clone().lock_owned()).await?;
        Ok(LockToken { _guard: guard })
    }

    pub fn try_acquire(&self) -> Option<LockToken> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| LockToken { _guard: guard })
    }
}

impl Default for DeadlineLock {
    fn default() -> Self {
        DeadlineLock::new()
    }
}

/// Scoped proof of lock ownership; dropping it releases the lock.
#[derive(Debug)]
pub struct LockToken {
    _guard: OwnedMutexGuard<()>,
}

pub struct SharedQueues {
    queues: DashMap<FastStr, Arc<SharedQueue<Value>>>,
}

impl SharedQueues {
    pub fn new() -> Self {
        SharedQueues {
            queues: DashMap::new(),
        }
    }

    pub fn get(&self, name: impl Into<FastStr>) -> Arc<SharedQueue<Value>> {
        self.queues.entry(name.into()).or_default().clone()
    }
}

impl Default for SharedQueues {
    fn default() -> Self {
        SharedQueues::new()
    }
}

pub struct SharedLocks {
    locks: DashMap<FastStr, Arc<DeadlineLock>>,
}

impl SharedLocks {
    pub fn new() -> Self {
        SharedLocks {
            locks: DashMap::new(),
        }
    }

    pub fn get(&self, name: impl Into<FastStr>) -> Arc<DeadlineLock> {
        self.locks.entry(name.into()).or_default().clone()
    }
}

impl Default for SharedLocks {
    fn default() -> Self {
        SharedLocks::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn queue_pop_honours_deadline() {
        let queue: SharedQueue<i64> = SharedQueue::new();
        let request = Request::fake(Duration::from_secs(1));
        let err = queue.pop(&request).await.unwrap_err();
        assert!(err.is_deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_delivers_across_tasks() {
        let queue = Arc::new(SharedQueue::<i64>::new());
        let pusher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            pusher.push(42);
        });
        let request = Request::fake(Duration::from_secs(5));
        assert_eq!(queue.pop(&request).await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_times_out_and_releases_on_drop() {
        let lock = Arc::new(DeadlineLock::new());
        let held = lock
            .acquire(&Request::fake(Duration::from_secs(10)))
            .await
            .unwrap();

        let err = lock
            .acquire(&Request::fake(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_deadline());

        drop(held);
        assert!(lock
            .acquire(&Request::fake(Duration::from_secs(1)))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn registries_return_same_instance() {
        let queues = SharedQueues::new();
        let a = queues.get("retry");
        a.push(Value::Int(1));
        let b = queues.get("retry");
        assert_eq!(b.try_pop(), Some(Value::Int(1)));

        let locks = SharedLocks::new();
        let first = locks.get("makedirs");
        let token = first.try_acquire().unwrap();
        assert!(locks.get("makedirs").try_acquire().is_none());
        drop(token);
    }
}
