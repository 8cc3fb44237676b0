//! Bounded in-memory queues.
//!
//! Two overflow policies, matching how each queue is fed: `offer` fails
//! fast (caller-visible, used for outbound messages) and `offer_evict`
//! drops the oldest element to admit the new one (used for inbound
//! messages and log records, where losing the oldest beats losing the
//! newest).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Append an element, failing if the queue is full.
    /// On failure the element is handed back to the caller.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        drop(queue);
        self.available.notify_one();
        Ok(())
    }

    /// Append an element, evicting the oldest one if the queue is full.
    /// Returns the evicted element, if any.
    pub fn offer_evict(&self, item: T) -> Option<T> {
        let mut queue = self.inner.lock().unwrap();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(item);
        drop(queue);
        self.available.notify_one();
        evicted
    }

    /// Remove and return the oldest element, waiting up to `timeout` for
    /// one to arrive. Returns `None` on expiry.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock().unwrap();

        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self.available.wait_timeout(queue, remaining).unwrap();
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    /// Remove and return the oldest element without waiting.
    pub fn try_poll(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().unwrap().drain(..).collect()
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copy of the current contents, oldest first, without consuming.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }
}
