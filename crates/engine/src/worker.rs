//! The asynchronous engine mode.

use crate::Engine;
use granite_core::{EngineMessage, EventChannel, MessageQueue, NetChannel};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// Runs an [`Engine`] on a dedicated worker thread.
///
/// The inbound channels deposit into a FIFO queue; the worker drains it
/// one item at a time, so every tree mutation, round transition and
/// broadcast happens on that thread. Producers never block and never touch
/// engine state.
pub struct EngineWorker {
    queue: Arc<MessageQueue<EngineMessage>>,
    thread: Option<JoinHandle<Engine>>,
}

impl EngineWorker {
    /// Spawn the worker and subscribe it to the inbound channels.
    pub fn spawn(mut engine: Engine, in_net: &NetChannel, in_event: &EventChannel) -> Self {
        let queue = Arc::new(MessageQueue::new());

        let q = queue.clone();
        in_net.subscribe(move |envelope| q.push(EngineMessage::Net(envelope.clone())));
        let q = queue.clone();
        in_event.subscribe(move |event| q.push(EngineMessage::Event(event.clone())));

        let q = queue.clone();
        let thread = std::thread::Builder::new()
            .name("granite-engine".into())
            .spawn(move || {
                info!("engine worker started");
                while let Some(message) = q.pop_wait() {
                    engine.process_message(message);
                }
                info!("engine worker terminated");
                engine
            })
            .expect("spawning the engine worker");

        Self {
            queue,
            thread: Some(thread),
        }
    }

    /// Items waiting for the worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stop the worker: terminate the queue, join the thread and hand the
    /// engine back. In-flight processing completes first.
    pub fn stop(mut self) -> Engine {
        self.queue.terminate();
        let thread = self.thread.take().expect("worker thread is present");
        thread.join().expect("engine worker panicked")
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.queue.terminate();
            let _ = thread.join();
        }
    }
}
