//! # Quorra Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── harness.rs      # Deterministic in-process cluster
//!     ├── scenarios.rs    # Normal case, out-of-context replay, leader change
//!     ├── byzantine.rs    # Equivocating leader, duplicated traffic, forged proofs
//!     ├── recovery.rs     # Watermarks, state transfer, stop/restart, view change
//!     └── runtime.rs      # Async runners over the in-memory network
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p quorra-tests
//! cargo test -p quorra-tests integration::byzantine::
//! cargo bench -p quorra-tests
//! ```

#![allow(dead_code)]

pub mod integration;
