//! # Quorra Node
//!
//! Wiring for a local replica cluster.
//!
//! Every replica gets its own runner task, tokio round timers and a signing
//! sink, and all of them share one in-memory network and one command queue.
//! Only the current leader pulls batches from the queue, so sharing it is how
//! clients reach "whoever leads".
//!
//! ```text
//!  clients ──submit──→ QueueBatchProvider ──next_batch──→ leader
//!                                                          │
//!                         InMemoryNetwork ←──PROPOSE/WRITE/ACCEPT──┘
//!                               │
//!               ┌───────────────┼───────────────┐
//!               ↓               ↓               ↓
//!          ReplicaRunner   ReplicaRunner   ReplicaRunner ...
//!               │               │               │
//!               └──────→ CommandLog (per replica)
//! ```

pub mod admin;
pub mod cluster;
pub mod config;

pub use admin::{start_admin_server, AdminServer};
pub use cluster::{CommandLog, LocalCluster};
pub use config::NodeConfig;
