//! DAG decision graph: vertices with multiple parents, an injected conflict
//! predicate, and safe-prefix finality.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use meridian_core::{Bag, DecisionStatus, Id, Parameters};
use tracing::{debug, info};

use crate::confidence::ConfidenceState;
use crate::errors::GraphError;
use crate::graph::{DecisionGraph, PollOutcome};
use crate::types::Decision;

/// Application-defined conflict relation between decisions.
///
/// Must be deterministic, symmetric, and irreflexive: every node has to
/// group the same vertices the same way or the network cannot converge.
pub trait ConflictRule: Send + Sync {
    fn conflicts(&self, a: &Decision, b: &Decision) -> bool;
}

impl<F> ConflictRule for F
where
    F: Fn(&Decision, &Decision) -> bool + Send + Sync,
{
    fn conflicts(&self, a: &Decision, b: &Decision) -> bool {
        self(a, b)
    }
}

/// The trivial rule: nothing ever conflicts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConflicts;

impl ConflictRule for NoConflicts {
    fn conflicts(&self, _a: &Decision, _b: &Decision) -> bool {
        false
    }
}

struct DagVertex {
    decision: Decision,
    children: Vec<Id>,
    status: DecisionStatus,
    group: usize,
}

struct ConflictGroup {
    members: Vec<Id>,
    state: ConfidenceState,
}

/// Vertex DAG with confidence tracking per conflict set.
///
/// Conflict sets are the connected components of the injected predicate
/// over undecided vertices; merging happens as vertices arrive. A vertex is
/// accepted once three conditions meet: its conflict set finalized in its
/// favor, every parent is accepted (the accepted set stays downward-closed),
/// and it lies in the safe prefix — the common ancestry of every frontier
/// tip. Accepting a vertex rejects everything the predicate pits against it,
/// plus all descendants of anything rejected.
///
/// Storage is arena-style: vertices in a flat table keyed by id, groups in
/// a slot vector, links as id lists. The safe prefix is cached and
/// recomputed only after the frontier changes.
pub struct DagGraph {
    params: Parameters,
    rule: Arc<dyn ConflictRule>,
    vertices: HashMap<Id, DagVertex>,
    groups: Vec<Option<ConflictGroup>>,
    /// Finalized-in-favor vertices still waiting on parents or the safe
    /// prefix, in (height, id) order.
    pending: BTreeSet<(u64, Id)>,
    accepted: BTreeSet<(u64, Id)>,
    num_processing: usize,
    topology_version: u64,
    safe_prefix_cache: Option<(u64, BTreeSet<Id>)>,
}

impl DagGraph {
    /// Build a DAG rooted at an already-final genesis vertex.
    pub fn new(genesis: Decision, params: Parameters, rule: Arc<dyn ConflictRule>) -> Self {
        let genesis_id = genesis.id;
        let genesis_height = genesis.height;
        let mut vertices = HashMap::new();
        vertices.insert(
            genesis_id,
            DagVertex {
                decision: genesis,
                children: Vec::new(),
                status: DecisionStatus::Accepted,
                group: usize::MAX,
            },
        );
        let mut accepted = BTreeSet::new();
        accepted.insert((genesis_height, genesis_id));
        Self {
            params,
            rule,
            vertices,
            groups: Vec::new(),
            pending: BTreeSet::new(),
            accepted,
            num_processing: 0,
            topology_version: 0,
            safe_prefix_cache: None,
        }
    }

    /// Whether `to` is an ancestor of `from` (reflexively: a vertex reaches
    /// itself).
    pub fn is_reachable(&self, from: &Id, to: &Id) -> bool {
        if !self.vertices.contains_key(from) || !self.vertices.contains_key(to) {
            return false;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*from]);
        while let Some(id) = queue.pop_front() {
            if id == *to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(vertex) = self.vertices.get(&id) {
                queue.extend(vertex.decision.parents.iter().copied());
            }
        }
        false
    }

    /// Current tips: non-rejected vertices all of whose children (if any)
    /// are rejected. Ordered by id.
    pub fn frontier(&self) -> Vec<Id> {
        let mut tips: Vec<Id> = self
            .vertices
            .iter()
            .filter(|(_, vertex)| {
                vertex.status != DecisionStatus::Rejected
                    && vertex.children.iter().all(|child| {
                        self.vertices
                            .get(child)
                            .map(|c| c.status == DecisionStatus::Rejected)
                            .unwrap_or(true)
                    })
            })
            .map(|(id, _)| *id)
            .collect();
        tips.sort();
        tips
    }

    /// A maximal antichain over the processing vertices: pairwise
    /// unreachable, and no further processing vertex can join. Built
    /// greedily in (height, id) order, so the result is deterministic.
    pub fn antichain(&self) -> Vec<Id> {
        let mut universe: Vec<(u64, Id)> = self
            .vertices
            .iter()
            .filter(|(_, vertex)| vertex.status.is_processing())
            .map(|(id, vertex)| (vertex.decision.height, *id))
            .collect();
        universe.sort();

        let mut chosen: Vec<Id> = Vec::new();
        for (_, candidate) in universe {
            let independent = chosen.iter().all(|existing| {
                !self.is_reachable(&candidate, existing) && !self.is_reachable(existing, &candidate)
            });
            if independent {
                chosen.push(candidate);
            }
        }
        chosen.sort();
        chosen
    }

    /// The safe prefix: every vertex that is an ancestor (reflexively) of
    /// every frontier tip. Downward-closed by construction. Cached until
    /// the topology changes.
    pub fn safe_prefix(&mut self) -> BTreeSet<Id> {
        if let Some((version, cached)) = &self.safe_prefix_cache {
            if *version == self.topology_version {
                return cached.clone();
            }
        }
        let computed = self.compute_safe_prefix();
        self.safe_prefix_cache = Some((self.topology_version, computed.clone()));
        computed
    }

    fn compute_safe_prefix(&self) -> BTreeSet<Id> {
        let mut intersection: Option<BTreeSet<Id>> = None;
        for tip in self.frontier() {
            let ancestors = self.ancestor_set(&tip);
            intersection = Some(match intersection {
                None => ancestors,
                Some(current) => current.intersection(&ancestors).copied().collect(),
            });
            if intersection.as_ref().is_some_and(|set| set.is_empty()) {
                break;
            }
        }
        intersection.unwrap_or_default()
    }

    fn ancestor_set(&self, id: &Id) -> BTreeSet<Id> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([*id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(vertex) = self.vertices.get(&current) {
                queue.extend(vertex.decision.parents.iter().copied());
            }
        }
        seen
    }

    /// Pick up to `2f + 1` parents for a new vertex from `candidates`,
    /// preferring tips with more accumulated poll credit, ties broken by
    /// ascending id. Rejected or unknown candidates are skipped.
    pub fn choose_parents(&self, candidates: &[Id], f: usize) -> Vec<Id> {
        let mut scored: Vec<(u32, Id)> = candidates
            .iter()
            .filter_map(|id| {
                let vertex = self.vertices.get(id)?;
                match vertex.status {
                    DecisionStatus::Rejected => None,
                    DecisionStatus::Accepted => Some((u32::MAX, *id)),
                    _ => {
                        let credit = self
                            .groups
                            .get(vertex.group)
                            .and_then(|slot| slot.as_ref())
                            .map(|group| group.state.credit(id))
                            .unwrap_or(0);
                        Some((credit, *id))
                    }
                }
            })
            .collect();
        scored.sort_by(|(credit_a, id_a), (credit_b, id_b)| {
            credit_b.cmp(credit_a).then(id_a.cmp(id_b))
        });
        scored.dedup_by_key(|(_, id)| *id);
        scored.truncate(2 * f + 1);
        scored.into_iter().map(|(_, id)| id).collect()
    }

    /// Deterministic topological order of the accepted set, the order
    /// acceptor notifications fire in: height first, then id. Parents
    /// always precede children because height strictly increases along
    /// every edge.
    pub fn horizon_order(&self) -> Vec<Id> {
        self.accepted.iter().map(|(_, id)| *id).collect()
    }

    fn group_of(&self, id: &Id) -> Option<&ConflictGroup> {
        let vertex = self.vertices.get(id)?;
        self.groups.get(vertex.group)?.as_ref()
    }

    fn place_in_group(&mut self, id: Id) {
        // Collect what the newcomer conflicts with among undecided
        // vertices. Conflicts with accepted vertices or with the already
        // finalized winner of a group doom the newcomer instead.
        let Some(new_decision) = self.vertices.get(&id).map(|v| v.decision.clone()) else {
            return;
        };
        let mut touching: BTreeSet<usize> = BTreeSet::new();
        let mut doomed = false;

        for (other_id, other) in &self.vertices {
            if *other_id == id || other.status == DecisionStatus::Rejected {
                continue;
            }
            if !self.rule.conflicts(&new_decision, &other.decision) {
                continue;
            }
            match other.status {
                DecisionStatus::Accepted => {
                    doomed = true;
                    break;
                }
                _ => {
                    if let Some(group) = self.groups.get(other.group).and_then(|s| s.as_ref()) {
                        if group.state.is_finalized() {
                            if group.state.preference() == *other_id {
                                doomed = true;
                                break;
                            }
                            // Conflicting only with a doomed loser; no
                            // grouping needed.
                        } else {
                            touching.insert(other.group);
                        }
                    }
                }
            }
        }

        if doomed {
            debug!(%id, "vertex conflicts with a settled decision");
            let mut outcome = PollOutcome::default();
            self.reject_cascade(id, &mut outcome);
            return;
        }

        let slot = if touching.is_empty() {
            let state = ConfidenceState::new(id, &self.params);
            self.groups.push(Some(ConflictGroup {
                members: vec![id],
                state,
            }));
            self.groups.len() - 1
        } else if touching.len() == 1 {
            let slot = touching.iter().next().copied().unwrap_or(0);
            if let Some(Some(group)) = self.groups.get_mut(slot) {
                group.members.push(id);
                group.state.add_choice(id);
            }
            slot
        } else {
            // The newcomer bridges several conflict sets; merge them,
            // carrying each value's credit and resetting the streak.
            let mut members = vec![id];
            let mut credits = vec![(id, 0u32)];
            for &slot in &touching {
                if let Some(group) = self.groups.get_mut(slot).and_then(|s| s.take()) {
                    credits.extend(group.state.credits());
                    members.extend(group.members);
                }
            }
            let state = ConfidenceState::from_credits(credits, &self.params)
                .unwrap_or_else(|| ConfidenceState::new(id, &self.params));
            self.groups.push(Some(ConflictGroup { members, state }));
            let slot = self.groups.len() - 1;
            let moved = self.groups[slot]
                .as_ref()
                .map(|g| g.members.clone())
                .unwrap_or_default();
            for member in moved {
                if let Some(vertex) = self.vertices.get_mut(&member) {
                    vertex.group = slot;
                }
            }
            slot
        };

        if let Some(vertex) = self.vertices.get_mut(&id) {
            vertex.group = slot;
        }
    }

    fn on_group_finalized(&mut self, slot: usize, outcome: &mut PollOutcome) {
        let Some(group) = self.groups.get_mut(slot).and_then(|s| s.take()) else {
            return;
        };
        let winner = group.state.preference();
        info!(%winner, "conflict set finalized");

        let winner_decision = match self.vertices.get(&winner) {
            Some(vertex) => vertex.decision.clone(),
            None => return,
        };
        let losers: Vec<Id> = group
            .members
            .iter()
            .filter(|member| {
                **member != winner
                    && self
                        .vertices
                        .get(member)
                        .map(|vertex| self.rule.conflicts(&winner_decision, &vertex.decision))
                        .unwrap_or(false)
            })
            .copied()
            .collect();
        for loser in losers {
            self.reject_cascade(loser, outcome);
        }

        // Survivors are collected only after every cascade has settled, so
        // a member rejected as some loser's descendant cannot sneak back in.
        let survivors: Vec<(Id, u32)> = group
            .members
            .iter()
            .filter(|member| {
                **member != winner
                    && self
                        .vertices
                        .get(member)
                        .is_some_and(|vertex| vertex.status.is_processing())
            })
            .map(|member| (*member, group.state.credit(member)))
            .collect();

        // Members that conflicted with other members but not the winner
        // fight on in a fresh group, keeping their earned credit.
        if let Some(state) = ConfidenceState::from_credits(survivors.clone(), &self.params) {
            self.groups.push(Some(ConflictGroup {
                members: survivors.iter().map(|(id, _)| *id).collect(),
                state,
            }));
            let slot = self.groups.len() - 1;
            for (id, _) in survivors {
                if let Some(vertex) = self.vertices.get_mut(&id) {
                    vertex.group = slot;
                }
            }
        }

        // A pathological rule can pit a vertex against its own ancestor, in
        // which case the cascade above may have taken the winner down too.
        if self
            .vertices
            .get(&winner)
            .is_some_and(|vertex| vertex.status.is_processing())
        {
            self.pending.insert((winner_decision.height, winner));
        }
        self.drain_pending(outcome);
    }

    /// Accept every pending winner whose parents are accepted and that sits
    /// inside the safe prefix, repeating until a pass makes no progress.
    fn drain_pending(&mut self, outcome: &mut PollOutcome) {
        loop {
            let safe = self.safe_prefix();
            let ready: Vec<(u64, Id)> = self
                .pending
                .iter()
                .filter(|(_, id)| {
                    safe.contains(id)
                        && self
                            .vertices
                            .get(id)
                            .map(|vertex| {
                                vertex.decision.parents.iter().all(|parent| {
                                    self.vertices
                                        .get(parent)
                                        .map(|p| p.status == DecisionStatus::Accepted)
                                        .unwrap_or(false)
                                })
                            })
                            .unwrap_or(false)
                })
                .copied()
                .collect();
            if ready.is_empty() {
                return;
            }
            for (height, id) in ready {
                self.pending.remove(&(height, id));
                self.accept_one(id, outcome);
            }
        }
    }

    fn accept_one(&mut self, id: Id, outcome: &mut PollOutcome) {
        let Some(vertex) = self.vertices.get_mut(&id) else {
            return;
        };
        if !vertex.status.is_processing() {
            return;
        }
        vertex.status = DecisionStatus::Accepted;
        let decision = vertex.decision.clone();
        self.num_processing -= 1;
        self.accepted.insert((decision.height, id));
        self.topology_version += 1;
        info!(%id, height = decision.height, "vertex accepted");
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
            let was_processing = vertex.status.is_processing();
            vertex.status = DecisionStatus::Rejected;
            let height = vertex.decision.height;
            let group = vertex.group;
            stack.extend(vertex.children.iter().copied());
            if was_processing {
                self.num_processing -= 1;
            }
            self.pending.remove(&(height, id));
            self.topology_version += 1;
            debug!(%id, "vertex rejected");
            outcome.rejected.push(id);
            self.remove_from_group(group, id);
        }
    }

    /// Drop a rejected member from its conflict group, rebuilding the
    /// group state so the dead vertex can never be preferred again.
    fn remove_from_group(&mut self, slot: usize, id: Id) {
        let Some(Some(group)) = self.groups.get_mut(slot) else {
            return;
        };
        if !group.members.contains(&id) {
            return;
        }
        group.members.retain(|member| *member != id);
        if group.members.is_empty() {
            self.groups[slot] = None;
            return;
        }
        if group.state.is_finalized() {
            // The winner was already extracted; the leftover slot is dead.
            return;
        }
        let survivors: Vec<(Id, u32)> = group
            .members
            .iter()
            .map(|member| (*member, group.state.credit(member)))
            .collect();
        if let Some(state) = ConfidenceState::from_credits(survivors, &self.params) {
            group.state = state;
        }
    }
}

impl DecisionGraph for DagGraph {
    fn insert(&mut self, decision: Decision) -> Result<(), GraphError> {
        if decision.parents.is_empty() {
            return Err(GraphError::MalformedParents {
                decision: decision.id,
                got: 0,
                expected: "at least one",
            });
        }

        if let Some(existing) = self.vertices.get(&decision.id) {
            if existing.decision.parents == decision.parents {
                return Ok(());
            }
            return Err(GraphError::ConflictingReinsert {
                decision: decision.id,
            });
        }

        let mut max_parent_height = 0u64;
        let mut doomed_parent = false;
        for parent in &decision.parents {
            match self.vertices.get(parent) {
                Some(vertex) => {
                    max_parent_height = max_parent_height.max(vertex.decision.height);
                    doomed_parent |= vertex.status == DecisionStatus::Rejected;
                }
                None => {
                    return Err(GraphError::UnknownParent {
                        decision: decision.id,
                        parent: *parent,
                    })
                }
            }
        }
        if decision.height != max_parent_height + 1 {
            return Err(GraphError::HeightMismatch {
                decision: decision.id,
                got: decision.height,
                expected: max_parent_height + 1,
            });
        }

        let id = decision.id;
        let parents = decision.parents.clone();
        self.vertices.insert(
            id,
            DagVertex {
                decision,
                children: Vec::new(),
                status: if doomed_parent {
                    DecisionStatus::Rejected
                } else {
                    DecisionStatus::Processing
                },
                group: usize::MAX,
            },
        );
        for parent in &parents {
            if let Some(vertex) = self.vertices.get_mut(parent) {
                vertex.children.push(id);
            }
        }
        self.topology_version += 1;

        if doomed_parent {
            debug!(%id, "vertex under a rejected parent");
            return Ok(());
        }

        self.num_processing += 1;
        self.place_in_group(id);
        debug!(%id, "vertex inserted");
        Ok(())
    }

    fn record_poll(&mut self, target: Id, votes: &Bag<Id>) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        let Some(vertex) = self.vertices.get(&target) else {
            return outcome;
        };
        if !vertex.status.is_processing() {
            return outcome;
        }
        let slot = vertex.group;
        let finalized = match self.groups.get_mut(slot).and_then(|s| s.as_mut()) {
            Some(group) => group.state.record_poll(votes),
            None => false,
        };
        if finalized {
            self.on_group_finalized(slot, &mut outcome);
        }
        outcome
    }

    fn preference(&self) -> Id {
        self.poll_targets()
            .into_iter()
            .next()
            .or_else(|| self.accepted.iter().next_back().map(|(_, id)| *id))
            .unwrap_or(Id::ZERO)
    }

    fn poll_targets(&self) -> Vec<Id> {
        // One representative per undecided conflict set — its current
        // preference — so every live set keeps receiving votes even when it
        // is buried under newer frontier vertices.
        let mut targets: Vec<(u64, Id)> = self
            .groups
            .iter()
            .flatten()
            .filter(|group| !group.state.is_finalized())
            .filter_map(|group| {
                let preference = group.state.preference();
                self.vertices
                    .get(&preference)
                    .filter(|vertex| vertex.status.is_processing())
                    .map(|vertex| (vertex.decision.height, preference))
            })
            .collect();
        targets.sort();
        targets.dedup();
        targets.into_iter().map(|(_, id)| id).collect()
    }

    fn status(&self, id: &Id) -> DecisionStatus {
        match self.vertices.get(id) {
            None => DecisionStatus::Unknown,
            Some(vertex) => match vertex.status {
                DecisionStatus::Processing => {
                    // Pending winners (finalized, awaiting commit) and the
                    // live preference of a conflict set both report as
                    // preferred.
                    let preferred = self.pending.contains(&(vertex.decision.height, *id))
                        || self
                            .group_of(id)
                            .is_some_and(|group| group.state.preference() == *id);
                    if preferred {
                        DecisionStatus::Preferred
                    } else {
                        DecisionStatus::Processing
                    }
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
            .filter(|(_, vertex)| vertex.status.is_processing())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn num_processing(&self) -> usize {
        self.num_processing
    }
}
