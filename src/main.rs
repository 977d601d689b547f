// Meridian - sampling-based BFT consensus engine
//
// Demonstration node: runs a single-process simulated validator cluster and
// drives a chain of blocks to finality through the full engine stack —
// weighted sampling, the polling pipeline, confidence tracking, commit
// persistence, and acceptor notification. Useful as a smoke test and as a
// worked example of how a host embeds the engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use meridian_consensus::{
    AcceptorRegistry, BootstrapSignal, ChainEngine, ChainGraph, Decision, EngineConfig,
};
use meridian_core::{Id, NodeId, Parameters, StaticValidators, Validator};
use meridian_network::{SimNetwork, VoterBehavior};
use meridian_storage::{CommitStore, MemoryStore};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meridian", about = "Simulated Meridian consensus cluster")]
struct Args {
    /// Number of simulated validators.
    #[arg(long, default_value_t = 21)]
    validators: usize,

    /// Number of blocks to finalize before exiting.
    #[arg(long, default_value_t = 5)]
    blocks: u64,

    /// Seed for the sampling RNG.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn node_id(index: usize) -> NodeId {
    let mut bytes = [0u8; NodeId::LEN];
    bytes[..8].copy_from_slice(&(index as u64).to_be_bytes());
    NodeId::from_bytes(bytes)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meridian=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        validators = args.validators,
        blocks = args.blocks,
        "starting simulated cluster"
    );

    // Every validator is honest in this demo; each round they all vote for
    // the block currently being decided.
    let network = Arc::new(SimNetwork::new());
    let mut validators = Vec::with_capacity(args.validators);
    for index in 0..args.validators {
        let node = node_id(index);
        network.register(node, VoterBehavior::Silent);
        validators.push(Validator::new(node, 1));
    }

    let k = args.validators.min(20);
    let params = Parameters {
        k,
        alpha_preference: 2 * k / 3 + 1,
        alpha_confidence: 2 * k / 3 + 1,
        beta: 4,
        concurrent_polls: 1,
        max_outstanding_items: 16,
        max_item_processing_time: Duration::from_secs(10),
    };

    let genesis = Decision::with_id(Id::ZERO, Vec::new(), 0, Vec::new());
    let store = Arc::new(MemoryStore::new());
    let acceptors = Arc::new(AcceptorRegistry::new());
    let config = EngineConfig {
        chain: Id::digest(b"meridian-demo"),
        params: params.clone(),
        poll_timeout: Duration::from_secs(1),
        sample_seed: args.seed,
    };
    acceptors.register(
        config.chain,
        "demo-log",
        Arc::new(|_chain: Id, decision: Id, payload: &[u8]| -> anyhow::Result<()> {
            let body: serde_json::Value = serde_json::from_slice(payload)?;
            info!(%decision, %body, "block accepted");
            Ok(())
        }),
        false,
    );

    let engine = ChainEngine::new(
        config,
        ChainGraph::new(genesis.clone(), params),
        network.clone(),
        Arc::new(StaticValidators::new(validators)),
        store.clone() as Arc<dyn CommitStore>,
        acceptors,
    )?
    .with_bootstrap(BootstrapSignal::ready());
    engine.start().await?;

    let mut parent = genesis;
    for height in 1..=args.blocks {
        let payload = serde_json::to_vec(&serde_json::json!({
            "height": height,
            "producer": "demo",
        }))?;
        let block = Decision::new(vec![parent.id], height, payload);

        // The honest majority converges on the new block.
        for node in network.nodes() {
            network.register(node, VoterBehavior::Prefer(block.id));
        }
        engine.add(block.clone())?;

        let mut rounds = 0;
        while !engine.is_accepted(&block.id) {
            engine.poll_tick();
            for reply in network.drain() {
                engine.record_reply(reply.poll_id, reply.from, reply.vote);
            }
            rounds += 1;
            if rounds > 1_000 {
                bail!("block {} failed to finalize", block.id);
            }
        }
        info!(height, rounds, "block finalized");
        parent = block;
    }

    let health = engine.health_check();
    info!(
        polls = health.polls_completed,
        accepted = health.decisions_accepted,
        healthy = health.healthy,
        "cluster run complete"
    );
    engine.stop().await?;
    Ok(())
}
