//! In-flight poll bookkeeping: sampled peers, reply bags, deadlines.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use meridian_core::{Bag, Id, NodeId};
use tracing::{debug, trace};

use crate::errors::ConsensusError;

/// One outstanding poll: a question about `target` asked to `peers`.
///
/// A poll completes when every sampled peer has replied or been dropped, or
/// when its deadline passes. Either way the reply bag — possibly partial —
/// is valid input for the confidence state machine. Replies are credited
/// only to the poll they name; each poll owns its bag exclusively.
#[derive(Debug, Clone)]
pub struct Poll {
    pub id: u32,
    pub target: Id,
    pub peers: Vec<NodeId>,
    pub replies: Bag<Id>,
    pub issued_at: Instant,
    pub deadline: Instant,
    outstanding: HashSet<NodeId>,
}

impl Poll {
    /// Peers that have not replied and were not dropped.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Result of feeding one reply into the poll set.
#[derive(Debug)]
pub enum ReplyOutcome {
    /// Counted; the poll is still waiting on other peers.
    Recorded,
    /// This reply was the last one; the finished poll is returned.
    Completed(Poll),
    /// Unknown poll, peer outside the sample, or duplicate. Dropped
    /// silently — an adversary may replay at will.
    Ignored,
}

/// All in-flight polls for one engine, with the per-decision concurrency
/// budget.
#[derive(Debug)]
pub struct PollSet {
    concurrent_polls: usize,
    next_id: u32,
    active: BTreeMap<u32, Poll>,
    in_flight: HashMap<Id, usize>,
}

impl PollSet {
    pub fn new(concurrent_polls: usize) -> Self {
        Self {
            concurrent_polls,
            next_id: 0,
            active: BTreeMap::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Register a new poll and return its id.
    ///
    /// Fails with [`ConsensusError::TooManyPolls`] when `target` already has
    /// the configured number of polls in flight.
    pub fn issue(
        &mut self,
        target: Id,
        peers: Vec<NodeId>,
        now: Instant,
        timeout: Duration,
    ) -> Result<u32, ConsensusError> {
        let in_flight = self.in_flight.entry(target).or_insert(0);
        if *in_flight >= self.concurrent_polls {
            return Err(ConsensusError::TooManyPolls {
                decision: target,
                limit: self.concurrent_polls,
            });
        }
        *in_flight += 1;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let poll = Poll {
            id,
            target,
            outstanding: peers.iter().copied().collect(),
            peers,
            replies: Bag::new(),
            issued_at: now,
            deadline: now + timeout,
        };
        trace!(poll = id, decision = %target, peers = poll.peers.len(), "poll issued");
        self.active.insert(id, poll);
        Ok(id)
    }

    /// Record one peer's vote. See [`ReplyOutcome`] for the cases.
    pub fn record_reply(&mut self, poll_id: u32, from: NodeId, vote: Id) -> ReplyOutcome {
        let Some(poll) = self.active.get_mut(&poll_id) else {
            trace!(poll = poll_id, peer = %from, "reply for unknown poll dropped");
            return ReplyOutcome::Ignored;
        };
        if !poll.outstanding.remove(&from) {
            trace!(poll = poll_id, peer = %from, "duplicate or foreign reply dropped");
            return ReplyOutcome::Ignored;
        }
        poll.replies.add(vote);
        if poll.is_complete() {
            match self.finish(poll_id) {
                Some(done) => ReplyOutcome::Completed(done),
                None => ReplyOutcome::Ignored,
            }
        } else {
            ReplyOutcome::Recorded
        }
    }

    /// Mark a peer as never going to reply (its transport send failed).
    /// Returns the finished poll if this was the last outstanding peer.
    pub fn drop_peer(&mut self, poll_id: u32, peer: NodeId) -> Option<Poll> {
        let poll = self.active.get_mut(&poll_id)?;
        if !poll.outstanding.remove(&peer) {
            return None;
        }
        debug!(poll = poll_id, peer = %peer, "peer dropped from poll");
        if poll.is_complete() {
            self.finish(poll_id)
        } else {
            None
        }
    }

    /// Terminate one poll early, returning it with its partial bag.
    pub fn timeout(&mut self, poll_id: u32) -> Option<Poll> {
        let poll = self.finish(poll_id)?;
        debug!(poll = poll_id, "poll timed out");
        Some(poll)
    }

    /// Remove and return every poll whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Poll> {
        let overdue: Vec<u32> = self
            .active
            .values()
            .filter(|poll| poll.deadline <= now)
            .map(|poll| poll.id)
            .collect();
        overdue.into_iter().filter_map(|id| self.finish(id)).collect()
    }

    /// Remove and return every poll, regardless of deadline. Used when the
    /// engine force-closes during shutdown.
    pub fn drain(&mut self) -> Vec<Poll> {
        let ids: Vec<u32> = self.active.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.finish(id)).collect()
    }

    /// Polls currently in flight for `target`.
    pub fn outstanding_for(&self, target: &Id) -> usize {
        self.in_flight.get(target).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Age of the oldest in-flight poll.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.active
            .values()
            .map(|poll| now.saturating_duration_since(poll.issued_at))
            .max()
    }

    fn finish(&mut self, poll_id: u32) -> Option<Poll> {
        let poll = self.active.remove(&poll_id)?;
        if let Some(count) = self.in_flight.get_mut(&poll.target) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(&poll.target);
            }
        }
        Some(poll)
    }
}
