//! FIFO handoff between producers and the engine worker.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueState<T> {
    items: VecDeque<T>,
    done: bool,
}

/// FIFO queue feeding the engine worker.
///
/// Producers push from arbitrary threads; the single consumer blocks in
/// [`MessageQueue::pop_wait`] until an item arrives or the queue is
/// terminated. Capacity is bounded only by upstream rate limits.
pub struct MessageQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                done: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue an item. Dropped silently once the queue is terminated.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.items.push_back(item);
        self.available.notify_one();
    }

    /// Dequeue the next item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Dequeue the next item, blocking until one arrives.
    ///
    /// Returns `None` once [`MessageQueue::terminate`] has been called,
    /// which unwinds the consumer loop.
    pub fn pop_wait(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.done {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.available.wait(&mut state);
        }
    }

    /// Finish working with the queue: wakes the waiting consumer, which
    /// then observes `None`.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.available.notify_all();
    }

    /// Current queue length.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
