//! Events crossing the engine boundary
//!
//! - consumed: inputs queued for a replica runner
//! - published: notifications handed to the upper layer

mod consumed;
mod published;

pub use consumed::*;
pub use published::*;
