//! End-to-end chain scenarios: a single engine driven through the full
//! stack — simulated network, polling pipeline, confidence tracking,
//! persistence, and acceptor hooks.

use std::sync::Arc;
use std::time::Duration;

use meridian_consensus::{
    AcceptorRegistry, ChainEngine, ChainGraph, ConsensusEngine, Decision, EngineConfig,
};
use meridian_core::{Id, NodeId, Parameters, StaticValidators, Validator};
use meridian_network::{SimNetwork, VoterBehavior};
use meridian_storage::{CommitStore, MemoryStore};

fn node_id(index: usize) -> NodeId {
    let mut bytes = [0u8; NodeId::LEN];
    bytes[..8].copy_from_slice(&(index as u64).to_be_bytes());
    NodeId::from_bytes(bytes)
}

fn genesis() -> Decision {
    Decision::with_id(Id::ZERO, Vec::new(), 0, Vec::new())
}

fn block(parent: &Decision, tag: &[u8]) -> Decision {
    Decision::new(vec![parent.id], parent.height + 1, tag.to_vec())
}

struct Cluster {
    network: Arc<SimNetwork>,
    engine: ChainEngine,
    store: Arc<MemoryStore>,
}

impl Cluster {
    fn build(validators: usize, params: Parameters) -> Self {
        let network = Arc::new(SimNetwork::new());
        let mut set = Vec::with_capacity(validators);
        for index in 0..validators {
            let node = node_id(index);
            network.register(node, VoterBehavior::Silent);
            set.push(Validator::new(node, 1));
        }

        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            chain: Id::digest(b"chain-scenarios"),
            params: params.clone(),
            poll_timeout: Duration::from_secs(60),
            sample_seed: 7,
        };
        let engine = ConsensusEngine::new(
            config,
            ChainGraph::new(genesis(), params),
            network.clone(),
            Arc::new(StaticValidators::new(set)),
            store.clone() as Arc<dyn CommitStore>,
            Arc::new(AcceptorRegistry::new()),
        )
        .unwrap();

        Self {
            network,
            engine,
            store,
        }
    }

    fn set_all(&self, behavior: VoterBehavior) {
        for node in self.network.nodes() {
            self.network.register(node, behavior.clone());
        }
    }

    /// One poll round: issue polls, then deliver every queued reply.
    fn round(&self) {
        self.engine.poll_tick();
        for reply in self.network.drain() {
            self.engine.record_reply(reply.poll_id, reply.from, reply.vote);
        }
    }
}

/// Twenty honest peers voting the same block every round finalize it after
/// exactly beta rounds, never earlier.
#[tokio::test]
async fn test_unanimous_network_finalizes_after_beta_rounds() {
    let params = Parameters {
        k: 20,
        alpha_preference: 15,
        alpha_confidence: 15,
        beta: 20,
        concurrent_polls: 1,
        max_outstanding_items: 8,
        max_item_processing_time: Duration::from_secs(30),
    };
    let cluster = Cluster::build(20, params);
    cluster.engine.start().await.unwrap();

    let d1 = block(&genesis(), b"d1");
    cluster.engine.add(d1.clone()).unwrap();
    cluster.set_all(VoterBehavior::Prefer(d1.id));

    for round in 1..=20u32 {
        assert!(!cluster.engine.is_accepted(&d1.id), "round {round}");
        cluster.round();
    }
    assert!(cluster.engine.is_accepted(&d1.id));

    let health = cluster.engine.health_check();
    assert_eq!(health.polls_completed, 20);
    assert_eq!(health.decisions_accepted, 1);
    assert_eq!(health.processing, 0);
    assert!(health.healthy);
}

/// A mid-run majority flip: the early leader banks ten successful polls, so
/// the challenger needs eleven of its own before the preference moves, and
/// acceptance of the challenger lands only after a full fresh beta streak.
#[tokio::test]
async fn test_majority_flip_respects_banked_credit() {
    let params = Parameters {
        k: 20,
        alpha_preference: 15,
        alpha_confidence: 15,
        beta: 20,
        concurrent_polls: 1,
        max_outstanding_items: 8,
        max_item_processing_time: Duration::from_secs(30),
    };
    let cluster = Cluster::build(20, params);
    cluster.engine.start().await.unwrap();

    let g = genesis();
    let d1 = block(&g, b"d1");
    let d2 = block(&g, b"d2");
    cluster.engine.add(d1.clone()).unwrap();
    cluster.engine.add(d2.clone()).unwrap();

    // Rounds 1-10: 18 peers for d1, 2 for d2. Rounds 11+: flipped.
    let majority: Vec<Id> = std::iter::repeat(d1.id)
        .take(10)
        .chain(std::iter::repeat(d2.id).take(35))
        .collect();
    let minority: Vec<Id> = std::iter::repeat(d2.id)
        .take(10)
        .chain(std::iter::repeat(d1.id).take(35))
        .collect();
    for (index, node) in cluster.network.nodes().into_iter().enumerate() {
        let script = if index < 18 {
            majority.clone()
        } else {
            minority.clone()
        };
        cluster.network.register(node, VoterBehavior::FollowScript(script));
    }

    let mut switch_round = None;
    let mut accept_round = None;
    for round in 1..=45u32 {
        cluster.round();
        if switch_round.is_none() && cluster.engine.preference() == d2.id {
            switch_round = Some(round);
        }
        if accept_round.is_none() && cluster.engine.is_accepted(&d2.id) {
            accept_round = Some(round);
            break;
        }
    }

    // Ten banked polls for d1 mean the 11th d2 success — round 21 — flips
    // the preference; a fresh 20-round streak accepts at round 40.
    assert_eq!(switch_round, Some(21));
    assert_eq!(accept_round, Some(40));
    assert!(cluster.engine.is_accepted(&d2.id));
    assert!(!cluster.engine.is_accepted(&d1.id));
}

/// Eight threads deliver replies for distinct peers of the same poll; the
/// poll completes exactly once with one vote per peer.
#[tokio::test]
async fn test_concurrent_replies_from_eight_threads() {
    let params = Parameters {
        k: 8,
        alpha_preference: 5,
        alpha_confidence: 5,
        beta: 1,
        concurrent_polls: 1,
        max_outstanding_items: 8,
        max_item_processing_time: Duration::from_secs(30),
    };
    let cluster = Cluster::build(8, params);
    cluster.engine.start().await.unwrap();

    let d1 = block(&genesis(), b"d1");
    cluster.engine.add(d1.clone()).unwrap();

    // Peers stay silent; the test delivers the replies itself. With k equal
    // to the validator count the sample is the whole set.
    assert_eq!(cluster.engine.poll_tick(), 1);

    let mut handles = Vec::new();
    for index in 0..8 {
        let engine = cluster.engine.clone();
        let vote = d1.id;
        handles.push(std::thread::spawn(move || {
            engine.record_reply(0, node_id(index), vote);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let health = cluster.engine.health_check();
    assert_eq!(health.polls_completed, 1);
    assert!(cluster.engine.is_accepted(&d1.id));
}

/// Three pipelined polls on one decision, completed out of order: each
/// poll's bag stays its own, and each completion is one FSM input.
#[tokio::test]
async fn test_pipelined_polls_complete_out_of_order() {
    let params = Parameters {
        k: 5,
        alpha_preference: 3,
        alpha_confidence: 3,
        beta: 3,
        concurrent_polls: 3,
        max_outstanding_items: 8,
        max_item_processing_time: Duration::from_secs(30),
    };
    let cluster = Cluster::build(5, params);
    cluster.engine.start().await.unwrap();

    let d1 = block(&genesis(), b"d1");
    cluster.engine.add(d1.clone()).unwrap();

    // One tick pipelines the full budget of three polls (ids 0, 1, 2).
    assert_eq!(cluster.engine.poll_tick(), 3);

    let complete = |poll_id: u32| {
        for index in 0..5 {
            cluster.engine.record_reply(poll_id, node_id(index), d1.id);
        }
    };

    complete(1);
    assert_eq!(cluster.engine.health_check().polls_completed, 1);
    assert!(!cluster.engine.is_accepted(&d1.id));

    complete(0);
    assert_eq!(cluster.engine.health_check().polls_completed, 2);
    assert!(!cluster.engine.is_accepted(&d1.id));

    // A reply from a peer outside the sample changes nothing.
    cluster.engine.record_reply(2, node_id(99), d1.id);

    complete(2);
    assert_eq!(cluster.engine.health_check().polls_completed, 3);
    assert!(cluster.engine.is_accepted(&d1.id));
}

/// Liveness with an honest supermajority: fifteen of twenty peers agree,
/// exactly meeting alpha, and the decision lands in beta rounds even though
/// five adversarial peers vote for garbage.
#[tokio::test]
async fn test_liveness_with_honest_supermajority() {
    let params = Parameters {
        k: 20,
        alpha_preference: 15,
        alpha_confidence: 15,
        beta: 5,
        concurrent_polls: 1,
        max_outstanding_items: 8,
        max_item_processing_time: Duration::from_secs(30),
    };
    let cluster = Cluster::build(20, params);
    cluster.engine.start().await.unwrap();

    let d1 = block(&genesis(), b"d1");
    cluster.engine.add(d1.clone()).unwrap();

    let junk = Id::digest(b"adversarial-vote");
    for (index, node) in cluster.network.nodes().into_iter().enumerate() {
        let behavior = if index < 15 {
            VoterBehavior::Prefer(d1.id)
        } else {
            VoterBehavior::Prefer(junk)
        };
        cluster.network.register(node, behavior);
    }

    for round in 1..=5u32 {
        assert!(!cluster.engine.is_accepted(&d1.id), "round {round}");
        cluster.round();
    }
    assert!(cluster.engine.is_accepted(&d1.id));
}

/// Silent peers never reply; timeouts feed the partial bags and the honest
/// majority still finalizes.
#[tokio::test]
async fn test_timeouts_preserve_liveness_with_silent_peers() {
    let params = Parameters {
        k: 20,
        alpha_preference: 15,
        alpha_confidence: 15,
        beta: 3,
        concurrent_polls: 1,
        max_outstanding_items: 8,
        max_item_processing_time: Duration::from_secs(30),
    };
    let cluster = Cluster::build(20, params);
    cluster.engine.start().await.unwrap();

    let d1 = block(&genesis(), b"d1");
    cluster.engine.add(d1.clone()).unwrap();

    for (index, node) in cluster.network.nodes().into_iter().enumerate() {
        let behavior = if index < 15 {
            VoterBehavior::Prefer(d1.id)
        } else {
            VoterBehavior::Silent
        };
        cluster.network.register(node, behavior);
    }

    for round in 0..3u32 {
        cluster.round();
        assert!(!cluster.engine.is_accepted(&d1.id));
        // Five peers never answer; close the poll on its partial bag.
        cluster.engine.record_timeout(round);
    }
    assert!(cluster.engine.is_accepted(&d1.id));
    assert_eq!(cluster.engine.health_check().polls_completed, 3);
}

/// A finalized chain survives in the commit store in order.
#[tokio::test]
async fn test_commit_records_for_a_finalized_chain() {
    let params = Parameters {
        k: 5,
        alpha_preference: 3,
        alpha_confidence: 3,
        beta: 2,
        concurrent_polls: 1,
        max_outstanding_items: 8,
        max_item_processing_time: Duration::from_secs(30),
    };
    let cluster = Cluster::build(5, params);
    cluster.engine.start().await.unwrap();

    let g = genesis();
    let b1 = block(&g, b"one");
    let b2 = block(&b1, b"two");
    cluster.engine.add(b1.clone()).unwrap();
    cluster.engine.add(b2.clone()).unwrap();
    cluster.set_all(VoterBehavior::Prefer(b2.id));

    for _ in 0..2 {
        cluster.round();
    }
    assert!(cluster.engine.is_accepted(&b1.id));
    assert!(cluster.engine.is_accepted(&b2.id));

    let first = meridian_storage::load_commit(cluster.store.as_ref(), &b1.id)
        .unwrap()
        .unwrap();
    let second = meridian_storage::load_commit(cluster.store.as_ref(), &b2.id)
        .unwrap()
        .unwrap();
    assert_eq!(first.height, 1);
    assert_eq!(second.height, 2);
    assert_eq!(second.parents, vec![b1.id]);
    assert!(first.accepted_at <= second.accepted_at);
}
