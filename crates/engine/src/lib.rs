//! The round manager.
//!
//! The engine consumes accepted-block events and protocol messages, drives
//! the per-round voting state machine, and publishes finality:
//!
//! - block events open and retire rounds and close prevote windows
//! - round-phase messages are deduplicated, re-gossiped while they match
//!   the live round, and fed to the active round
//! - completed rounds yield a proof, which advances the local last
//!   irreversible block, is cached for lagging peers, and is announced via
//!   a finality notice
//! - peers catch up through the notice → request-proof → proof exchange
//!
//! The engine is a synchronous state machine touched by exactly one thread.
//! In synchronous mode the caller invokes [`Engine::process_message`]
//! directly; in asynchronous mode [`EngineWorker`] runs the engine on a
//! dedicated thread fed by a FIFO queue.

mod config;
mod engine;
mod worker;

pub use config::{EngineError, IdentityMode};
pub use engine::{
    Engine, MAX_FINALITY_LAG_BLOCKS, MSG_EXPIRATION, PREVOTE_WIDTH, ROUND_WIDTH,
};
pub use worker::EngineWorker;
