//! Linear-chain decision graph: a block tree where same-parent siblings
//! conflict and exactly one path from genesis is ever accepted.

use std::collections::HashMap;

use meridian_core::{Bag, DecisionStatus, Id, Parameters};
use tracing::{debug, info};

use crate::confidence::ConfidenceState;
use crate::errors::GraphError;
use crate::graph::{DecisionGraph, PollOutcome};
use crate::types::Decision;

struct ChainVertex {
    decision: Decision,
    children: Vec<Id>,
    status: DecisionStatus,
}

/// Block tree with per-sibling-group confidence tracking.
///
/// The conflict rule is structural: two decisions at the same height with
/// the same parent always conflict, so each parent's children share one
/// [`ConfidenceState`]. Accepting a block accepts its whole ancestor path
/// and rejects every competing sibling along it, together with their
/// descendants.
///
/// Vertices live in a flat table keyed by id; parent/child links are id
/// lists, so the tree has no ownership cycles and cascades are plain
/// worklist walks.
pub struct ChainGraph {
    params: Parameters,
    vertices: HashMap<Id, ChainVertex>,
    /// One confidence state per sibling group, keyed by the parent id.
    groups: HashMap<Id, ConfidenceState>,
    last_accepted: Id,
    forced_preference: Option<Id>,
    num_processing: usize,
}

impl ChainGraph {
    /// Build a graph rooted at an already-final genesis decision.
    pub fn new(genesis: Decision, params: Parameters) -> Self {
        let genesis_id = genesis.id;
        let mut vertices = HashMap::new();
        vertices.insert(
            genesis_id,
            ChainVertex {
                decision: genesis,
                children: Vec::new(),
                status: DecisionStatus::Accepted,
            },
        );
        Self {
            params,
            vertices,
            groups: HashMap::new(),
            last_accepted: genesis_id,
            forced_preference: None,
            num_processing: 0,
        }
    }

    /// The deepest accepted block.
    pub fn last_accepted(&self) -> Id {
        self.last_accepted
    }

    /// Force the preferred tip to `id`. The ancestors of `id` become the
    /// preferred path automatically; nothing below a tip can be preferred.
    /// Returns false if `id` is not a processing decision.
    pub fn set_preference(&mut self, id: Id) -> bool {
        match self.vertices.get(&id) {
            Some(vertex) if vertex.status == DecisionStatus::Processing => {
                debug!(%id, "preference forced");
                self.forced_preference = Some(id);
                true
            }
            _ => false,
        }
    }

    fn finalize(&mut self, winner: Id) -> PollOutcome {
        // Walk up to the nearest accepted ancestor, then accept downward.
        let mut path = Vec::new();
        let mut cursor = winner;
        while let Some(vertex) = self.vertices.get(&cursor) {
            if vertex.status == DecisionStatus::Accepted {
                break;
            }
            path.push(cursor);
            match vertex.decision.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        path.reverse();

        let mut outcome = PollOutcome::default();
        for id in path {
            self.accept_one(id, &mut outcome);
        }
        outcome
    }

    fn accept_one(&mut self, id: Id, outcome: &mut PollOutcome) {
        let Some(vertex) = self.vertices.get_mut(&id) else {
            return;
        };
        if vertex.status != DecisionStatus::Processing {
            return;
        }
        vertex.status = DecisionStatus::Accepted;
        let decision = vertex.decision.clone();
        self.num_processing -= 1;
        self.last_accepted = id;
        if self.forced_preference == Some(id) {
            self.forced_preference = None;
        }
        info!(%id, height = decision.height, "decision accepted");

        // Every competing sibling loses, along with its whole subtree.
        if let Some(parent) = decision.parent() {
            let siblings: Vec<Id> = self
                .vertices
                .get(&parent)
                .map(|p| p.children.iter().copied().filter(|c| *c != id).collect())
                .unwrap_or_default();
            for sibling in siblings {
                self.reject_cascade(sibling, outcome);
            }
            self.groups.remove(&parent);
        }

        outcome.accepted.push(decision);
    }

    fn reject_cascade(&mut self, root: Id, outcome: &mut PollOutcome) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(vertex) = self.vertices.get_mut(&id) else {
                continue;
            };
            if vertex.status.is_terminal() {
                continue;
            }
            vertex.status = DecisionStatus::Rejected;
            self.num_processing -= 1;
            if self.forced_preference == Some(id) {
                self.forced_preference = None;
            }
            debug!(%id, "decision rejected");
            outcome.rejected.push(id);
            stack.extend(vertex.children.iter().copied());
            self.groups.remove(&id);
        }
    }

    fn on_preferred_path(&self, id: &Id) -> bool {
        let mut cursor = self.preference();
        loop {
            if cursor == *id {
                return true;
            }
            let Some(vertex) = self.vertices.get(&cursor) else {
                return false;
            };
            if vertex.status == DecisionStatus::Accepted {
                return false;
            }
            match vertex.decision.parent() {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }
}

impl DecisionGraph for ChainGraph {
    fn insert(&mut self, decision: Decision) -> Result<(), GraphError> {
        let Some(parent_id) = decision.parent() else {
            return Err(GraphError::MalformedParents {
                decision: decision.id,
                got: decision.parents.len(),
                expected: "exactly one",
            });
        };

        if let Some(existing) = self.vertices.get(&decision.id) {
            if existing.decision.parents == decision.parents {
                return Ok(());
            }
            return Err(GraphError::ConflictingReinsert {
                decision: decision.id,
            });
        }

        let (parent_status, parent_height) = match self.vertices.get(&parent_id) {
            Some(parent) => (parent.status, parent.decision.height),
            None => {
                return Err(GraphError::UnknownParent {
                    decision: decision.id,
                    parent: parent_id,
                })
            }
        };
        if decision.height != parent_height + 1 {
            return Err(GraphError::HeightMismatch {
                decision: decision.id,
                got: decision.height,
                expected: parent_height + 1,
            });
        }

        let id = decision.id;
        if parent_status == DecisionStatus::Rejected {
            // A child of a rejected block can never be accepted; record it
            // as rejected immediately so late descendants settle too.
            debug!(%id, parent = %parent_id, "child of rejected parent");
            self.vertices.insert(
                id,
                ChainVertex {
                    decision,
                    children: Vec::new(),
                    status: DecisionStatus::Rejected,
                },
            );
            return Ok(());
        }

        self.vertices.insert(
            id,
            ChainVertex {
                decision,
                children: Vec::new(),
                status: DecisionStatus::Processing,
            },
        );
        if let Some(parent) = self.vertices.get_mut(&parent_id) {
            parent.children.push(id);
        }
        self.groups
            .entry(parent_id)
            .and_modify(|state| state.add_choice(id))
            .or_insert_with(|| ConfidenceState::new(id, &self.params));
        self.num_processing += 1;
        debug!(%id, parent = %parent_id, "decision inserted");
        Ok(())
    }

    fn record_poll(&mut self, target: Id, votes: &Bag<Id>) -> PollOutcome {
        let Some(vertex) = self.vertices.get(&target) else {
            return PollOutcome::default();
        };
        if vertex.status != DecisionStatus::Processing {
            // Late poll on a decided target; nothing to learn.
            return PollOutcome::default();
        }
        let Some(parent) = vertex.decision.parent() else {
            return PollOutcome::default();
        };
        let Some(state) = self.groups.get_mut(&parent) else {
            return PollOutcome::default();
        };

        if state.record_poll(votes) {
            let winner = state.preference();
            self.finalize(winner)
        } else {
            PollOutcome::default()
        }
    }

    fn preference(&self) -> Id {
        if let Some(forced) = self.forced_preference {
            if self
                .vertices
                .get(&forced)
                .is_some_and(|v| v.status == DecisionStatus::Processing)
            {
                return forced;
            }
        }
        let mut cursor = self.last_accepted;
        while let Some(state) = self.groups.get(&cursor) {
            cursor = state.preference();
        }
        cursor
    }

    fn poll_targets(&self) -> Vec<Id> {
        let preference = self.preference();
        match self.vertices.get(&preference) {
            Some(vertex) if vertex.status == DecisionStatus::Processing => vec![preference],
            _ => Vec::new(),
        }
    }

    fn status(&self, id: &Id) -> DecisionStatus {
        match self.vertices.get(id) {
            None => DecisionStatus::Unknown,
            Some(vertex) => match vertex.status {
                DecisionStatus::Processing if self.on_preferred_path(id) => {
                    DecisionStatus::Preferred
                }
                status => status,
            },
        }
    }

    fn decision(&self, id: &Id) -> Option<&Decision> {
        self.vertices.get(id).map(|vertex| &vertex.decision)
    }

    fn processing(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .vertices
            .iter()
            .filter(|(_, vertex)| vertex.status == DecisionStatus::Processing)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn num_processing(&self) -> usize {
        self.num_processing
    }
}
