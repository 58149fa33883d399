//! Bounded single-producer/single-consumer frame queue
//!
//! The queue enforces backpressure on the producer through a fixed capacity
//! and supports two push modes: a non-blocking push whose rejection lets the
//! caller apply a drop policy, and a blocking push that waits with a bounded
//! poll interval. A draining mode wakes every blocked pusher during shutdown
//! so no thread stays parked past one poll cycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bounded FIFO queue with blocking and non-blocking push modes
///
/// Rejected pushes return the element so the caller keeps ownership and
/// decides what to do with it.
pub struct BoundedFrameQueue<T> {
    items: Mutex<VecDeque<T>>,
    filled: Condvar,
    space_available: Condvar,
    capacity: usize,
    draining: AtomicBool,
    poll_interval: Duration,
}

impl<T> BoundedFrameQueue<T> {
    /// Create a queue holding at most `capacity` elements
    pub fn new(capacity: usize) -> Self {
        Self::with_poll_interval(capacity, Duration::from_millis(100))
    }

    /// Create a queue with an explicit blocked-push poll interval
    pub fn with_poll_interval(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            filled: Condvar::new(),
            space_available: Condvar::new(),
            capacity: capacity.max(1),
            draining: AtomicBool::new(false),
            poll_interval,
        }
    }

    /// Maximum number of elements the queue holds
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued elements
    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("queue lock poisoned").is_empty()
    }

    /// Non-blocking push; returns the element back when the queue is full
    pub fn try_push(&self, elem: T) -> std::result::Result<(), T> {
        {
            let mut items = self.items.lock().expect("queue lock poisoned");
            if items.len() >= self.capacity {
                return Err(elem);
            }
            items.push_back(elem);
        }
        self.filled.notify_one();
        Ok(())
    }

    /// Blocking push; waits with a bounded poll interval until space is
    /// available or draining is set
    ///
    /// Returns the element back (un-enqueued) when the wait exits because of
    /// draining, so the caller still owns it.
    pub fn push_blocking(&self, elem: T) -> std::result::Result<(), T> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        while items.len() >= self.capacity && !self.draining.load(Ordering::SeqCst) {
            let (guard, _timeout) = self
                .space_available
                .wait_timeout(items, self.poll_interval)
                .expect("queue lock poisoned");
            items = guard;
        }
        if self.draining.load(Ordering::SeqCst) {
            return Err(elem);
        }
        items.push_back(elem);
        drop(items);
        self.filled.notify_one();
        Ok(())
    }

    /// Blocking pop; removes and returns the front element, waking any
    /// thread blocked in [`BoundedFrameQueue::push_blocking`]
    ///
    /// Waits with a bounded poll interval. Returns `None` only when the
    /// queue is empty and draining, so a consumer parked across shutdown is
    /// released within one poll cycle. Elements still queued are drained
    /// normally first.
    pub fn pop(&self) -> Option<T> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        loop {
            if let Some(elem) = items.pop_front() {
                drop(items);
                self.space_available.notify_one();
                return Some(elem);
            }
            if self.draining.load(Ordering::SeqCst) {
                return None;
            }
            let (guard, _timeout) = self
                .filled
                .wait_timeout(items, self.poll_interval)
                .expect("queue lock poisoned");
            items = guard;
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<T> {
        let elem = self
            .items
            .lock()
            .expect("queue lock poisoned")
            .pop_front();
        if elem.is_some() {
            self.space_available.notify_one();
        }
        elem
    }

    /// Set the draining flag; when true, all blocked pushers wake and get
    /// their element back immediately, and blocked poppers wake once the
    /// queue empties. Used only during shutdown.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
        if draining {
            self.space_available.notify_all();
            self.filled.notify_all();
        }
    }

    /// Whether the queue is draining
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Empty the queue without waking waiters (start-of-run reset)
    pub fn clear(&self) {
        self.items.lock().expect("queue lock poisoned").clear();
    }
}
