//! Quorum arithmetic
//!
//! Every threshold is expressed as the number of matching votes required,
//! i.e. "strictly more than" the classic bound:
//!
//! ```text
//! quorum            = ⌊(N + f) / 2⌋ + 1     (write / accept)
//! fast_decide       = ⌊(N + 3f) / 2⌋ + 1    (write-only decision)
//! freeze            = 2f + 1                (join / collect)
//! decide_messages   = f + 1                 (DECIDE relay)
//! ```
//!
//! For `N = 3f + 1` the write/accept quorum equals `⌈(N + f) / 2⌉ = 2f + 1`.

use serde::{Deserialize, Serialize};

/// Pure threshold calculator for a group of `n` replicas tolerating `f` faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCalculator {
    n: usize,
    f: usize,
}

impl QuorumCalculator {
    pub fn new(n: usize, f: usize) -> Self {
        Self { n, f }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn two_f(&self) -> usize {
        2 * self.f
    }

    /// Matching WRITE/ACCEPT votes needed to move past a phase.
    pub fn quorum(&self) -> usize {
        (self.n + self.f) / 2 + 1
    }

    /// Matching WRITE votes that decide without an ACCEPT phase.
    pub fn fast_decide_quorum(&self) -> usize {
        (self.n + 3 * self.f) / 2 + 1
    }

    /// Freezes needed before a replica joins a leader change.
    pub fn freeze_quorum(&self) -> usize {
        self.two_f() + 1
    }

    /// Matching DECIDE messages that prove a quorum was seen by a correct replica.
    pub fn decide_quorum(&self) -> usize {
        self.f + 1
    }

    /// Whether `n` replicas can tolerate `f` Byzantine ones.
    pub fn is_byzantine_safe(&self) -> bool {
        self.n > 3 * self.f
    }
}
