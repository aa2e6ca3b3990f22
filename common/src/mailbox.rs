//! Bounded async queue with predicate-based receive.
//!
//! Control replies arrive on the same socket as data. The receive loop pushes
//! them here and each waiting query pulls out the reply that belongs to it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Push, waiting while the mailbox is full.
    pub async fn push(&self, item: T) {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.queue.lock();
                if queue.len() < self.capacity {
                    queue.push_back(item);
                    drop(queue);
                    self.readable.notify_waiters();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Push without waiting. Hands the item back if the mailbox is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        drop(queue);
        self.readable.notify_waiters();
        Ok(())
    }

    /// Push without waiting, dropping the oldest item if full. Returns the
    /// dropped item.
    pub fn push_evict(&self, item: T) -> Option<T> {
        let mut queue = self.queue.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(item);
        drop(queue);
        self.readable.notify_waiters();
        evicted
    }

    /// Oldest item, waiting while the mailbox is empty.
    pub async fn pop(&self) -> T {
        self.pop_matching(|_| true).await
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.queue.lock().pop_front();
        if item.is_some() {
            self.writable.notify_waiters();
        }
        item
    }

    /// Oldest item satisfying `pred`, waiting until one arrives. Other items
    /// stay queued in order.
    pub async fn pop_matching<F>(&self, mut pred: F) -> T
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.queue.lock();
                if let Some(pos) = queue.iter().position(&mut pred) {
                    if let Some(item) = queue.remove(pos) {
                        drop(queue);
                        self.writable.notify_waiters();
                        return item;
                    }
                }
            }
            notified.await;
        }
    }
}
