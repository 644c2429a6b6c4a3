//! Typed multicast channel.

use parking_lot::Mutex;

type Subscriber<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A typed multicast channel: every subscriber sees every send.
///
/// Sends run the callbacks synchronously on the calling thread, so
/// subscribers must not block; a transport subscriber typically just
/// enqueues the value elsewhere.
pub struct Channel<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked for every subsequent send.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.lock().push(Box::new(callback));
    }

    /// Deliver `value` to every subscriber, in subscription order.
    pub fn send(&self, value: &T) {
        for subscriber in self.subscribers.lock().iter() {
            subscriber(value);
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}
