//! Fungible-token ledger kept as content-addressed state.
//!
//! A token actor's state is a merkle snapshot: metadata plus two hash-indexed
//! tries (balances, and per-holder approval maps), all reachable from one
//! SHA-256 root. Mutations derive a new root and never touch old blocks, so
//! any historical root stays readable.
//!
//! The crate splits into:
//! - [`store`]: the content-addressed block store and root type,
//! - [`hamt`]: the bitmap-compressed trie both ledgers are built from,
//! - [`state`]: version-dispatched read access plus the v1 codec,
//! - [`message`]: pure, offline construction of mutation messages,
//! - [`actor`]: the mutation semantics applied per message,
//! - [`engine`]: a single-threaded executor with nonces and receipts.

pub mod actor;
pub mod address;
pub mod amount;
pub mod engine;
pub mod hamt;
pub mod message;
pub mod state;
pub mod store;

mod error;

pub use error::{ActorError, BuildError, EngineError, StateError, StoreError};
