//! Message buffers owned by the execution manager
//!
//! - `OutOfContextBuffer`: messages for instances not yet active.
//! - `StoppedQueue`: messages received while the manager is stopped.
//!
//! Both are bounded. When the out-of-context buffer is full, the messages of
//! the farthest-ahead instance are evicted first, since nearer instances are
//! needed sooner; a message for the farthest instance itself is refused.
//! Proposals are kept one per round: the first one buffered for a round stays.

use super::{ConsensusMessage, InstanceId, MessageKind, RoundNumber};
use std::collections::{BTreeMap, VecDeque};

/// Result of buffering a message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferOutcome {
    Buffered,
    /// Buffered after evicting `evicted` messages of `instance`
    BufferedEvicting { instance: InstanceId, evicted: usize },
    Refused,
}

impl BufferOutcome {
    pub fn is_buffered(&self) -> bool {
        !matches!(self, BufferOutcome::Refused)
    }
}

/// Messages for instances that are not active yet.
#[derive(Debug)]
pub struct OutOfContextBuffer {
    /// Per instance, by round
    proposals: BTreeMap<InstanceId, BTreeMap<RoundNumber, ConsensusMessage>>,
    others: BTreeMap<InstanceId, Vec<ConsensusMessage>>,
    total: usize,
    max_total: usize,
    max_per_instance: usize,
}

impl OutOfContextBuffer {
    pub fn new(max_total: usize, max_per_instance: usize) -> Self {
        Self {
            proposals: BTreeMap::new(),
            others: BTreeMap::new(),
            total: 0,
            max_total,
            max_per_instance,
        }
    }

    pub fn push(&mut self, msg: ConsensusMessage) -> BufferOutcome {
        if msg.kind == MessageKind::Propose {
            if self
                .proposals
                .get(&msg.instance)
                .is_some_and(|rounds| rounds.contains_key(&msg.round))
            {
                return BufferOutcome::Refused;
            }
        } else if self
            .others
            .get(&msg.instance)
            .is_some_and(|list| list.len() >= self.max_per_instance)
        {
            return BufferOutcome::Refused;
        }

        let mut outcome = BufferOutcome::Buffered;
        if self.total >= self.max_total {
            let Some(farthest) = self.farthest_instance() else {
                return BufferOutcome::Refused;
            };
            if msg.instance >= farthest {
                return BufferOutcome::Refused;
            }
            let evicted = self.remove(farthest);
            outcome = BufferOutcome::BufferedEvicting {
                instance: farthest,
                evicted,
            };
        }

        self.total += 1;
        if msg.kind == MessageKind::Propose {
            self.proposals
                .entry(msg.instance)
                .or_default()
                .insert(msg.round, msg);
        } else {
            self.others.entry(msg.instance).or_default().push(msg);
        }
        outcome
    }

    /// Remove and return everything buffered for `instance`, proposals in
    /// round order.
    pub fn take(&mut self, instance: InstanceId) -> (Vec<ConsensusMessage>, Vec<ConsensusMessage>) {
        let proposals: Vec<ConsensusMessage> = self
            .proposals
            .remove(&instance)
            .map(|rounds| rounds.into_values().collect())
            .unwrap_or_default();
        let others = self.others.remove(&instance).unwrap_or_default();
        self.total -= proposals.len() + others.len();
        (proposals, others)
    }

    pub fn has(&self, instance: InstanceId) -> bool {
        self.proposals.contains_key(&instance) || self.others.contains_key(&instance)
    }

    pub fn proposals(&self, instance: InstanceId) -> Vec<&ConsensusMessage> {
        self.proposals
            .get(&instance)
            .map(|rounds| rounds.values().collect())
            .unwrap_or_default()
    }

    pub fn messages(&self, instance: InstanceId) -> &[ConsensusMessage] {
        self.others
            .get(&instance)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop everything for instances `<= upto`; returns how many messages went.
    pub fn purge_upto(&mut self, upto: InstanceId) -> usize {
        let keep_proposals = self.proposals.split_off(&(upto + 1));
        let keep_others = self.others.split_off(&(upto + 1));
        let dropped = self.proposals.values().map(BTreeMap::len).sum::<usize>()
            + self.others.values().map(Vec::len).sum::<usize>();
        self.proposals = keep_proposals;
        self.others = keep_others;
        self.total -= dropped;
        dropped
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn instance_count(&self) -> usize {
        let mut ids: Vec<&InstanceId> = self.proposals.keys().chain(self.others.keys()).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    fn farthest_instance(&self) -> Option<InstanceId> {
        let p = self.proposals.keys().next_back().copied();
        let o = self.others.keys().next_back().copied();
        p.max(o)
    }

    fn remove(&mut self, instance: InstanceId) -> usize {
        let (proposals, others) = self.take(instance);
        proposals.len() + others.len()
    }
}

/// FIFO of messages received while stopped. Oldest entries are dropped on overflow.
#[derive(Debug)]
pub struct StoppedQueue {
    queue: VecDeque<ConsensusMessage>,
    capacity: usize,
}

impl StoppedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue; returns the message dropped to make room, if any.
    pub fn push(&mut self, msg: ConsensusMessage) -> Option<ConsensusMessage> {
        let dropped = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(msg);
        dropped
    }

    pub fn drain(&mut self) -> Vec<ConsensusMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
