//! The dual-α threshold state machine driving finalization.

use std::collections::BTreeMap;

use meridian_core::{Bag, Id, Parameters};
use tracing::trace;

/// Confidence tracking for one set of mutually conflicting decisions.
///
/// Each completed poll on the set is reduced to its mode vote and fed in
/// here. Two thresholds split the roles of a result: `alpha_preference` is
/// the weaker bar a vote must clear for the poll to count at all, and
/// `alpha_confidence` the stronger bar required to earn credit toward
/// finalization. Once the current preference earns credit in `beta`
/// consecutive polls, the state finalizes and never changes again.
///
/// Per-value successful-poll credit is kept across preference switches, so
/// a value that has ever led keeps its standing: a challenger must
/// accumulate strictly more credit than the incumbent before it can take
/// over. This is what biases the random walk toward the network majority
/// and prevents unbounded oscillation between near-tied values.
#[derive(Debug, Clone)]
pub struct ConfidenceState {
    alpha_preference: usize,
    alpha_confidence: usize,
    beta: u32,
    preference: Id,
    confidence: u32,
    successful_polls: BTreeMap<Id, u32>,
    finalized: bool,
}

impl ConfidenceState {
    /// A fresh state preferring `initial`, with zero credit everywhere.
    pub fn new(initial: Id, params: &Parameters) -> Self {
        let mut successful_polls = BTreeMap::new();
        successful_polls.insert(initial, 0);
        Self {
            alpha_preference: params.alpha_preference,
            alpha_confidence: params.alpha_confidence,
            beta: params.beta,
            preference: initial,
            confidence: 0,
            successful_polls,
            finalized: false,
        }
    }

    /// Rebuild a state from per-value credit, used when conflict sets merge.
    /// The preference goes to the value with the most credit, ties to the
    /// smallest id; consecutive confidence restarts from zero.
    pub(crate) fn from_credits(
        credits: impl IntoIterator<Item = (Id, u32)>,
        params: &Parameters,
    ) -> Option<Self> {
        let successful_polls: BTreeMap<Id, u32> = credits.into_iter().collect();
        let preference = successful_polls
            .iter()
            .max_by(|(a_id, a_credit), (b_id, b_credit)| {
                a_credit.cmp(b_credit).then(b_id.cmp(a_id))
            })
            .map(|(id, _)| *id)?;
        Some(Self {
            alpha_preference: params.alpha_preference,
            alpha_confidence: params.alpha_confidence,
            beta: params.beta,
            preference,
            confidence: 0,
            successful_polls,
            finalized: false,
        })
    }

    /// Register a newly discovered competitor with zero credit. The current
    /// preference is unchanged; only successful polls can promote the new
    /// value. Registering after finalization or re-registering is a no-op.
    pub fn add_choice(&mut self, id: Id) {
        if self.finalized {
            return;
        }
        self.successful_polls.entry(id).or_insert(0);
    }

    /// Apply one completed poll. Returns `true` exactly on the poll that
    /// finalizes this state.
    ///
    /// Votes for values never registered through [`ConfidenceState::new`] or
    /// [`ConfidenceState::add_choice`] are discarded before the mode is
    /// taken, so garbage votes can only dilute a poll, never redirect it.
    pub fn record_poll(&mut self, votes: &Bag<Id>) -> bool {
        if self.finalized {
            return false;
        }

        let known = votes.filter(|id| self.successful_polls.contains_key(id));
        let Some((vote, count)) = known.mode() else {
            self.confidence = 0;
            return false;
        };

        if count < self.alpha_preference {
            // Unsuccessful poll: the preference stands but the streak breaks.
            self.confidence = 0;
            return false;
        }

        if vote != self.preference {
            if count >= self.alpha_confidence {
                *self.successful_polls.entry(vote).or_insert(0) += 1;
            }
            let challenger = self.credit(&vote);
            let incumbent = self.credit(&self.preference);
            if challenger > incumbent {
                trace!(
                    from = %self.preference,
                    to = %vote,
                    challenger,
                    incumbent,
                    "preference switched"
                );
                self.preference = vote;
                self.confidence = u32::from(count >= self.alpha_confidence);
            } else {
                self.confidence = 0;
            }
        } else if count >= self.alpha_confidence {
            self.confidence += 1;
            *self.successful_polls.entry(vote).or_insert(0) += 1;
        } else {
            self.confidence = 0;
        }

        if self.confidence >= self.beta {
            self.finalized = true;
        }
        self.finalized
    }

    pub fn preference(&self) -> Id {
        self.preference
    }

    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Successful-poll credit accumulated by `id`.
    pub fn credit(&self, id: &Id) -> u32 {
        self.successful_polls.get(id).copied().unwrap_or(0)
    }

    /// The registered competitors, in id order.
    pub fn choices(&self) -> impl Iterator<Item = &Id> {
        self.successful_polls.keys()
    }

    pub(crate) fn credits(&self) -> impl Iterator<Item = (Id, u32)> + '_ {
        self.successful_polls.iter().map(|(id, c)| (*id, *c))
    }
}
