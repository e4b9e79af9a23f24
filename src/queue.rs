// SPDX-License-Identifier: MPL-2.0

//! Bounded drop-oldest queue backing every inter-stage channel.
//!
//! ```text
//! ┌─────────────┐
//! │ Producer    │
//! └─────┬───────┘
//!       │ put_with_overflow() - evicts oldest if full, never blocks
//!       ▼
//! ┌─────────────┐
//! │ OverflowQue │  ← bounded, FIFO for delivered items
//! └─────┬───────┘
//!       │ get(timeout) / get_nowait()
//!       ▼
//! ┌─────────────┐
//! │ Consumer    │
//! └─────────────┘
//! ```
//!
//! # Key Guarantees
//!
//! - **Producers never block** on the overflow path: a full queue sheds its
//!   oldest element to admit the newest.
//! - **Loss is accounted**: every eviction increments `drop_count`; the
//!   backpressure monitor reads it to decide advisory state.
//! - **FIFO** holds for every item a consumer actually observes; evicted
//!   items vanish from the head and are never delivered.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ConfigError, RecvError};

/// Coarse usage bucket reported alongside queue metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    #[must_use]
    pub fn from_usage(usage: f64) -> Self {
        if usage < 0.5 {
            Self::Low
        } else if usage < 0.8 {
            Self::Medium
        } else if usage < 0.95 {
            Self::High
        } else {
            Self::Critical
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    /// enqueued minus acknowledged; evicted items are never acknowledged
    unfinished: u64,
}

/// A bounded, thread-safe queue that sheds its oldest element when full.
pub struct OverflowQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_tasks_done: Condvar,
    capacity: usize,
    // Separate lock so eviction accounting stays off the ring's hot path.
    drop_count: Mutex<u64>,
}

impl<T> OverflowQueue<T> {
    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_tasks_done: Condvar::new(),
            capacity,
            drop_count: Mutex::new(0),
        })
    }

    /// Enqueue without ever blocking; a full queue drops its oldest item.
    ///
    /// Returns `true` iff an eviction occurred.
    pub fn put_with_overflow(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = false;

        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            // The evicted item will never be acknowledged, so settle its
            // share of the unfinished count here (saturating: misuse of
            // task_done must not underflow).
            inner.unfinished = inner.unfinished.saturating_sub(1);
            if inner.unfinished == 0 {
                self.all_tasks_done.notify_all();
            }
            *self.drop_count.lock().unwrap() += 1;
            dropped = true;
        }

        inner.items.push_back(item);
        inner.unfinished += 1;
        self.not_empty.notify_one();
        dropped
    }

    /// Standard bounded put: blocks while the queue is full.
    pub fn put(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= self.capacity {
            inner = self.not_full.wait(inner).unwrap();
        }
        inner.items.push_back(item);
        inner.unfinished += 1;
        self.not_empty.notify_one();
    }

    /// Dequeue, waiting up to `timeout` for an item.
    pub fn get(&self, timeout: Duration) -> Result<T, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Ok(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RecvError::Timeout);
            }
            let (guard, result) = self.not_empty.wait_timeout(inner, remaining).unwrap();
            inner = guard;
            if result.timed_out() && inner.items.is_empty() {
                return Err(RecvError::Timeout);
            }
        }
    }

    /// Dequeue without waiting.
    pub fn get_nowait(&self) -> Result<T, RecvError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.items.pop_front() {
            Some(item) => {
                self.not_full.notify_one();
                Ok(item)
            }
            None => Err(RecvError::Empty),
        }
    }

    /// Acknowledge one previously dequeued item.
    pub fn task_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.unfinished = inner.unfinished.saturating_sub(1);
        if inner.unfinished == 0 {
            self.all_tasks_done.notify_all();
        }
    }

    /// Wait until every enqueued item has been acknowledged or dropped.
    ///
    /// Returns `false` on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.unfinished > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            inner = self.all_tasks_done.wait_timeout(inner, remaining).unwrap().0;
        }
        true
    }

    /// Drain every queued item, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.items.len();
        inner.items.clear();
        inner.unfinished = inner.unfinished.saturating_sub(removed as u64);
        if inner.unfinished == 0 {
            self.all_tasks_done.notify_all();
        }
        self.not_full.notify_all();
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill ratio in `[0, 1]`.
    #[must_use]
    pub fn usage(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.len()
    }

    #[must_use]
    pub fn unfinished(&self) -> u64 {
        self.inner.lock().unwrap().unfinished
    }

    /// Cumulative evictions since construction (or the last reset).
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        *self.drop_count.lock().unwrap()
    }

    pub fn reset_drop_count(&self) {
        *self.drop_count.lock().unwrap() = 0;
    }

    #[must_use]
    pub fn pressure_level(&self) -> PressureLevel {
        PressureLevel::from_usage(self.usage())
    }
}

impl<T> fmt::Debug for OverflowQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverflowQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("drop_count", &self.drop_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_capacity_rejected() {
        assert_eq!(
            OverflowQueue::<u32>::new(0).err(),
            Some(ConfigError::ZeroCapacity)
        );
    }

    #[test]
    fn fifo_for_delivered_items() {
        let queue = OverflowQueue::new(4).unwrap();
        for i in 0..4 {
            assert!(!queue.put_with_overflow(i));
        }
        for i in 0..4 {
            assert_eq!(queue.get_nowait().unwrap(), i);
        }
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = OverflowQueue::new(2).unwrap();
        queue.put_with_overflow(1);
        queue.put_with_overflow(2);
        assert!(queue.put_with_overflow(3));
        assert_eq!(queue.len(), 2);
        // 1 was evicted at the head; consumers never see it
        assert_eq!(queue.get_nowait().unwrap(), 2);
        assert_eq!(queue.get_nowait().unwrap(), 3);
        assert_eq!(queue.drop_count(), 1);
    }

    #[test]
    fn capacity_one_evicts_on_every_displacing_put() {
        let queue = OverflowQueue::new(1).unwrap();
        assert!(!queue.put_with_overflow(10));
        for i in 11..15 {
            assert!(queue.put_with_overflow(i));
        }
        assert_eq!(queue.drop_count(), 4);
        assert_eq!(queue.get_nowait().unwrap(), 14);
    }

    #[test]
    fn drop_count_matches_eviction_returns() {
        let queue = OverflowQueue::new(3).unwrap();
        let mut evictions = 0;
        for i in 0..50 {
            if queue.put_with_overflow(i) {
                evictions += 1;
            }
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.drop_count(), evictions);
        assert_eq!(evictions, 47);
    }

    #[test]
    fn get_times_out_when_empty() {
        let queue = OverflowQueue::<u32>::new(2).unwrap();
        let start = Instant::now();
        assert_eq!(
            queue.get(Duration::from_millis(30)),
            Err(RecvError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(queue.get_nowait(), Err(RecvError::Empty));
    }

    #[test]
    fn get_wakes_on_cross_thread_put() {
        let queue = Arc::new(OverflowQueue::new(2).unwrap());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put_with_overflow(99);
        });
        assert_eq!(queue.get(Duration::from_secs(2)).unwrap(), 99);
        handle.join().unwrap();
    }

    #[test]
    fn blocking_put_waits_for_space() {
        let queue = Arc::new(OverflowQueue::new(1).unwrap());
        queue.put(1);
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            producer.put(2); // blocks until the consumer below pops
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.get(Duration::from_secs(2)).unwrap(), 1);
        handle.join().unwrap();
        assert_eq!(queue.get_nowait().unwrap(), 2);
    }

    #[test]
    fn eviction_settles_unfinished_accounting() {
        let queue = OverflowQueue::new(1).unwrap();
        queue.put_with_overflow(1);
        queue.put_with_overflow(2); // evicts 1, which will never be acked
        assert_eq!(queue.unfinished(), 1);
        let _ = queue.get_nowait().unwrap();
        queue.task_done();
        assert_eq!(queue.unfinished(), 0);
        assert!(queue.join(Duration::from_millis(10)));
    }

    #[test]
    fn join_times_out_with_outstanding_work() {
        let queue = OverflowQueue::new(2).unwrap();
        queue.put_with_overflow(5);
        assert!(!queue.join(Duration::from_millis(20)));
    }

    #[test]
    fn pressure_levels_bucket_usage() {
        assert_eq!(PressureLevel::from_usage(0.0), PressureLevel::Low);
        assert_eq!(PressureLevel::from_usage(0.49), PressureLevel::Low);
        assert_eq!(PressureLevel::from_usage(0.5), PressureLevel::Medium);
        assert_eq!(PressureLevel::from_usage(0.8), PressureLevel::High);
        assert_eq!(PressureLevel::from_usage(0.95), PressureLevel::Critical);
        assert_eq!(PressureLevel::from_usage(1.0), PressureLevel::Critical);

        let queue = OverflowQueue::new(10).unwrap();
        for i in 0..9 {
            queue.put_with_overflow(i);
        }
        assert_eq!(queue.pressure_level(), PressureLevel::High);
        assert_eq!(queue.available(), 1);
    }

    #[test]
    fn clear_empties_and_unblocks() {
        let queue = OverflowQueue::new(4).unwrap();
        for i in 0..4 {
            queue.put_with_overflow(i);
        }
        assert_eq!(queue.clear(), 4);
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 0);
    }
}
