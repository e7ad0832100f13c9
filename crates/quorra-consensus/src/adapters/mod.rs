//! Adapters layer (hexagonal architecture)
//!
//! Production adapters (Keccak validation, secp256k1 signing, the signing
//! pool, tokio timers) plus in-memory ones used by the node binary and tests.

mod batches;
mod keccak;
mod network;
mod recording;
mod signer;
mod signing;
mod timers;

pub use batches::*;
pub use keccak::*;
pub use network::*;
pub use recording::*;
pub use signer::*;
pub use signing::*;
pub use timers::*;
