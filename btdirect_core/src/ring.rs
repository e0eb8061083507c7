//! Bounded reply ring shared by the protocol engines.
//!
//! One producer (the engine's reader task) and one consumer (the requesting
//! task, serialized by the engine's write mutex). When full, the oldest half
//! is dropped so a stalled consumer cannot wedge the reader.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

#[derive(Debug)]
pub struct ReplyRing<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> ReplyRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Appends an element, dropping the oldest half first when full.
    ///
    /// Returns the number of dropped elements.
    pub fn push(&self, item: T) -> usize {
        let dropped = {
            let mut queue = self.queue.lock().unwrap();
            let dropped = if queue.len() >= self.capacity {
                let count = (self.capacity / 2).max(1);
                queue.drain(..count);
                count
            } else {
                0
            };
            queue.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Removes every queued element.
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }

    /// Waits up to `timeout` for the next element.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if time::timeout(deadline - now, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

}
