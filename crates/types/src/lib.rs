//! Foundational types for the granite finality gadget.
//!
//! This crate provides the primitives shared by every other crate:
//!
//! - **Block identity**: [`BlockId`], an opaque hash with the block number
//!   embedded in its leading bytes, and [`BlockNum`]
//! - **Digests**: [`Digest`], the single fixed SHA-256 digest used for
//!   message signing and dedup keys
//! - **Crypto**: secp256k1 recoverable signatures ([`KeyPair`],
//!   [`PublicKey`], [`RecoverableSignature`]) and the [`SignatureProvider`]
//!   closure type that abstracts local keys from wallet-backed signers
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other workspace
//! crates, making it the foundation layer.

mod block;
mod crypto;
mod hash;

pub use block::{BlockId, BlockNum};
pub use crypto::{CryptoError, KeyPair, PublicKey, RecoverableSignature, SignatureProvider};
pub use hash::Digest;
