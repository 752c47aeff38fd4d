//! Bounded FIFO queue that drops the oldest element instead of blocking the
//! producer.
//!
//! Live video must not back-pressure its source: a stale frame is cheaper to
//! discard than to delay. `offer` therefore always succeeds, evicting the
//! oldest queued element when full. Consumers use a timed `poll`; a closed
//! queue reports shutdown once drained of pending work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PollError {
    #[error("poll timed out")]
    TimedOut,
    #[error("queue is shut down")]
    Shutdown,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("queue is shut down")]
pub struct ShutdownError;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    /// Signalled when an item is pushed or the queue closes.
    avail: Condvar,
    /// Signalled when an item is popped or the queue closes.
    space: Condvar,
}

/// Handle to a bounded drop-oldest queue. Clones share the same queue.
pub struct LossyQueue<T>(Arc<Inner<T>>);

impl<T> Clone for LossyQueue<T> {
    fn clone(&self) -> Self {
        LossyQueue(self.0.clone())
    }
}

impl<T> LossyQueue<T> {
    /// Create a queue with the given capacity. Capacity must be nonzero.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be nonzero");
        LossyQueue(Arc::new(Inner {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            avail: Condvar::new(),
            space: Condvar::new(),
        }))
    }

    /// Insert an item without ever blocking. When the queue is full the
    /// oldest element is dropped first. Returns `Err` if the queue is
    /// closed, `Ok(true)` if an old element was evicted.
    pub fn offer(&self, item: T) -> Result<bool, ShutdownError> {
        let mut state = self.0.state.lock();
        if state.closed {
            return Err(ShutdownError);
        }
        let mut dropped = false;
        if state.items.len() >= self.0.capacity {
            state.items.pop_front();
            dropped = true;
        }
        state.items.push_back(item);
        drop(state);
        self.0.avail.notify_one();
        Ok(dropped)
    }

    /// Insert an item, waiting up to `timeout` for free space. Returns
    /// `Ok(false)` when the timeout expired and the item was discarded.
    pub fn push_within(&self, item: T, timeout: Duration) -> Result<bool, ShutdownError> {
        let mut state = self.0.state.lock();
        while state.items.len() >= self.0.capacity && !state.closed {
            if self.0.space.wait_for(&mut state, timeout).timed_out() {
                break;
            }
        }
        if state.closed {
            return Err(ShutdownError);
        }
        if state.items.len() >= self.0.capacity {
            return Ok(false);
        }
        state.items.push_back(item);
        drop(state);
        self.0.avail.notify_one();
        Ok(true)
    }

    /// Remove and return the oldest item, waiting up to `timeout`.
    ///
    /// Pending items are still delivered after `close`; `Shutdown` is only
    /// reported once the queue is both closed and empty.
    pub fn poll(&self, timeout: Duration) -> Result<T, PollError> {
        let mut state = self.0.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.0.space.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(PollError::Shutdown);
            }
            if self.0.avail.wait_for(&mut state, timeout).timed_out() {
                // One more check: the notification may have raced the timeout.
                return match state.items.pop_front() {
                    Some(item) => {
                        drop(state);
                        self.0.space.notify_one();
                        Ok(item)
                    }
                    None if state.closed => Err(PollError::Shutdown),
                    None => Err(PollError::TimedOut),
                };
            }
        }
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.0.state.lock();
        let items = state.items.drain(..).collect();
        drop(state);
        self.0.space.notify_all();
        items
    }

    /// Close the queue, waking all waiters.
    pub fn close(&self) {
        let mut state = self.0.state.lock();
        state.closed = true;
        drop(state);
        self.0.avail.notify_all();
        self.0.space.notify_all();
    }

    pub fn len(&self) -> usize {
        self.0.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
