//! Domain layer for the consensus engine
//!
//! Pure state: no I/O, no locks, no async. The acceptor and the execution
//! manager drive these types.

mod batch;
mod buffer;
mod config;
mod error;
mod instance;
mod leader;
mod message;
mod quorum;
mod round;
mod view;

pub use batch::*;
pub use buffer::*;
pub use config::*;
pub use error::*;
pub use instance::*;
pub use leader::*;
pub use message::*;
pub use quorum::*;
pub use round::*;
pub use view::*;
