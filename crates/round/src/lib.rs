//! Per-round voting state machine.
//!
//! A round runs one prevote/precommit cycle over a fixed window of blocks:
//!
//! ```text
//! init ──prevote()──▶ prevote ──threshold──▶ ready_to_precommit
//!                       │                        │
//!                       │                        └─end_prevote()─▶ precommit ──threshold──▶ done
//!                       │                                              │
//!                       └─end_prevote()──▶ fail                        └─finish()──▶ fail
//! ```
//!
//! The round mutates the shared prefix tree it is handed per call and
//! returns [`RoundAction`]s for the engine to execute (broadcasts, and the
//! completion signal once the precommit supermajority is in). All I/O stays
//! with the engine.

mod round;

pub use round::{Round, RoundAction, RoundState};
