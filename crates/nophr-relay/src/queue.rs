//! Bounded per-subscription event queue.
//!
//! When the ingest side cannot keep up, the newest item must still get
//! in: the queue drops its oldest entries and counts them. The relay
//! socket is therefore never blocked on a slow consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an item, dropping the oldest entry when full.
    pub fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock().expect("Locking failed");
            if inner.closed {
                return;
            }
            if self.capacity <= inner.items.len() {
                inner.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Receive the next item; `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("Locking failed");
                if let Some(item) = inner.items.pop_front() {
                    // Wake any other waiter if items remain.
                    if !inner.items.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().expect("Locking failed").closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Locking failed").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn fifo_order() {
        let queue = BoundedQueue::new(8);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[test_log::test(tokio::test)]
    async fn drops_oldest_when_full() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[test_log::test(tokio::test)]
    async fn close_wakes_waiting_consumer() {
        let queue = Arc::new(BoundedQueue::<u32>::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn drains_before_reporting_closed() {
        let queue = BoundedQueue::new(4);
        queue.push(1);
        queue.close();
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }
}
