//! Plumbing between the engine and its host.
//!
//! This crate provides the pieces that carry inputs into the engine and
//! outputs back out:
//!
//! - [`Channel`]: typed multicast callbacks (in/out network, chain events,
//!   finality notifications)
//! - [`MessageQueue`]: the FIFO handoff between producer threads and the
//!   engine worker
//! - [`ChainEvent`], [`NetEnvelope`], [`EngineMessage`]: the input unions
//!
//! The engine itself is synchronous and deterministic; everything here
//! exists so that transports and the block-production event bus can feed it
//! from arbitrary threads.

mod channel;
mod event;
mod queue;

pub use channel::Channel;
pub use event::{ChainEvent, EngineMessage, NetEnvelope, SessionId};
pub use queue::MessageQueue;

use granite_types::BlockId;

/// Network messages in and out of the engine.
pub type NetChannel = Channel<NetEnvelope>;
/// Events from the underlying block-production engine.
pub type EventChannel = Channel<ChainEvent>;
/// Emits a block id each time the local last-irreversible block advances
/// through a proof.
pub type FinalityChannel = Channel<BlockId>;
