//! Cross-replica integration tests.

pub mod harness;

mod byzantine;
mod recovery;
mod runtime;
mod scenarios;
