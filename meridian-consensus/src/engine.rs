//! The engine orchestrator: binds a decision graph, the poll pipeline, the
//! sampler, and the injected collaborators behind a thread-safe API.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use meridian_core::{Id, NodeId, Parameters, ValidatorSource, WeightedSampler};
use meridian_storage::{CommitRecord, CommitStore, WriteBatch};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::acceptors::AcceptorRegistry;
use crate::certificates::CertificateSigner;
use crate::chain::ChainGraph;
use crate::dag::DagGraph;
use crate::errors::{ConsensusError, FatalError};
use crate::graph::{DecisionGraph, PollOutcome};
use crate::poll::{Poll, PollSet, ReplyOutcome};
use crate::transport::VoteTransport;
use crate::types::Decision;

/// Engine over the linear-chain graph.
pub type ChainEngine = ConsensusEngine<ChainGraph>;
/// Engine over the DAG graph.
pub type DagEngine = ConsensusEngine<DagGraph>;

/// Static engine configuration beyond the consensus [`Parameters`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chain this engine decides for; scopes acceptor registrations.
    pub chain: Id,
    pub params: Parameters,
    /// How long a poll may wait for replies before its partial bag is used.
    pub poll_timeout: Duration,
    /// Seed for the sampling RNG. Fixed seeds give reproducible runs.
    pub sample_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain: Id::ZERO,
            params: Parameters::default(),
            poll_timeout: Duration::from_secs(2),
            sample_seed: 0,
        }
    }
}

/// Engine lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Bootstrapping,
    NormalOp,
    Stopped,
}

const STATE_CREATED: u8 = 0;
const STATE_BOOTSTRAPPING: u8 = 1;
const STATE_NORMAL_OP: u8 = 2;
const STATE_STOPPED: u8 = 3;

fn state_from(raw: u8) -> EngineState {
    match raw {
        STATE_CREATED => EngineState::Created,
        STATE_BOOTSTRAPPING => EngineState::Bootstrapping,
        STATE_NORMAL_OP => EngineState::NormalOp,
        _ => EngineState::Stopped,
    }
}

/// Fires once when the host considers the node bootstrapped; the engine
/// waits for it before entering normal operation.
pub struct BootstrapSignal {
    rx: watch::Receiver<bool>,
}

/// The sending half of a [`BootstrapSignal`]. Dropping it without firing
/// aborts the engine's start.
pub struct BootstrapTrigger {
    tx: watch::Sender<bool>,
}

impl BootstrapSignal {
    /// A signal that has already fired; `start` proceeds immediately.
    pub fn ready() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    /// A signal the host fires later via the returned trigger.
    pub fn pending() -> (BootstrapTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (BootstrapTrigger { tx }, Self { rx })
    }

    async fn wait(mut self) -> Result<(), ConsensusError> {
        loop {
            if *self.rx.borrow_and_update() {
                return Ok(());
            }
            self.rx
                .changed()
                .await
                .map_err(|_| ConsensusError::NotRunning)?;
        }
    }
}

impl BootstrapTrigger {
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }
}

/// Snapshot of engine health for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub processing: usize,
    pub oldest_poll_age: Option<Duration>,
    pub polls_completed: u64,
    pub decisions_accepted: u64,
    /// False once any poll has been outstanding longer than
    /// `max_item_processing_time`.
    pub healthy: bool,
}

struct EngineInner<G> {
    graph: G,
    polls: PollSet,
    rng: ChaCha8Rng,
}

/// The consensus engine.
///
/// Cheap to clone — all state is shared behind `Arc`s — and safe to drive
/// from many threads at once: `add`, `record_reply`, `poll_tick`,
/// `is_accepted`, and `health_check` may all race freely. One mutex guards
/// the graph and poll pipeline; it is held only for state mutations and
/// released before transport sends, storage writes, and acceptor callbacks.
pub struct ConsensusEngine<G: DecisionGraph> {
    config: EngineConfig,
    inner: Arc<Mutex<EngineInner<G>>>,
    /// Outcomes awaiting persistence + notification, in production order.
    pending_commits: Arc<Mutex<VecDeque<PollOutcome>>>,
    /// Serializes the persist/notify path so acceptors observe acceptances
    /// in exactly the order the graph produced them.
    commit_lock: Arc<Mutex<()>>,
    transport: Arc<dyn VoteTransport>,
    validators: Arc<dyn ValidatorSource>,
    store: Arc<dyn CommitStore>,
    acceptors: Arc<AcceptorRegistry>,
    signer: Option<Arc<dyn CertificateSigner>>,
    state: Arc<AtomicU8>,
    bootstrap: Arc<Mutex<Option<BootstrapSignal>>>,
    shutdown: Arc<watch::Sender<bool>>,
    polls_completed: Arc<AtomicU64>,
    decisions_accepted: Arc<AtomicU64>,
    fatal_tx: mpsc::UnboundedSender<FatalError>,
    fatal_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<FatalError>>>>,
}

impl<G: DecisionGraph> Clone for ConsensusEngine<G> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            pending_commits: Arc::clone(&self.pending_commits),
            commit_lock: Arc::clone(&self.commit_lock),
            transport: Arc::clone(&self.transport),
            validators: Arc::clone(&self.validators),
            store: Arc::clone(&self.store),
            acceptors: Arc::clone(&self.acceptors),
            signer: self.signer.clone(),
            state: Arc::clone(&self.state),
            bootstrap: Arc::clone(&self.bootstrap),
            shutdown: Arc::clone(&self.shutdown),
            polls_completed: Arc::clone(&self.polls_completed),
            decisions_accepted: Arc::clone(&self.decisions_accepted),
            fatal_tx: self.fatal_tx.clone(),
            fatal_rx: Arc::clone(&self.fatal_rx),
        }
    }
}

impl<G: DecisionGraph> ConsensusEngine<G> {
    /// Assemble an engine. Parameters are validated here, once.
    pub fn new(
        config: EngineConfig,
        graph: G,
        transport: Arc<dyn VoteTransport>,
        validators: Arc<dyn ValidatorSource>,
        store: Arc<dyn CommitStore>,
        acceptors: Arc<AcceptorRegistry>,
    ) -> Result<Self, ConsensusError> {
        config.params.validate()?;
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Mutex::new(EngineInner {
                graph,
                polls: PollSet::new(config.params.concurrent_polls),
                rng: ChaCha8Rng::seed_from_u64(config.sample_seed),
            })),
            pending_commits: Arc::new(Mutex::new(VecDeque::new())),
            commit_lock: Arc::new(Mutex::new(())),
            transport,
            validators,
            store,
            acceptors,
            signer: None,
            state: Arc::new(AtomicU8::new(STATE_CREATED)),
            bootstrap: Arc::new(Mutex::new(Some(BootstrapSignal::ready()))),
            shutdown: Arc::new(shutdown),
            polls_completed: Arc::new(AtomicU64::new(0)),
            decisions_accepted: Arc::new(AtomicU64::new(0)),
            fatal_tx,
            fatal_rx: Arc::new(Mutex::new(Some(fatal_rx))),
            config,
        })
    }

    /// Defer normal operation until the given signal fires.
    pub fn with_bootstrap(self, signal: BootstrapSignal) -> Self {
        *self.bootstrap.lock() = Some(signal);
        self
    }

    /// Attach finality certificates to accepted decisions.
    pub fn with_certificate_signer(mut self, signer: Arc<dyn CertificateSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn state(&self) -> EngineState {
        state_from(self.state.load(Ordering::SeqCst))
    }

    /// Wait for bootstrap, spawn the deadline sweeper, and enter normal
    /// operation. Idempotent: repeated calls on a live engine are no-ops.
    pub async fn start(&self) -> Result<(), ConsensusError> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_BOOTSTRAPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_STOPPED) => return Err(ConsensusError::NotRunning),
            Err(_) => return Ok(()),
        }

        let signal = self.bootstrap.lock().take();
        if let Some(signal) = signal {
            if let Err(err) = signal.wait().await {
                warn!("bootstrap aborted before completion");
                self.state.store(STATE_STOPPED, Ordering::SeqCst);
                return Err(err);
            }
        }

        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = (self.config.poll_timeout / 4).max(Duration::from_millis(5));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.sweep(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("deadline sweeper stopped");
        });

        self.state.store(STATE_NORMAL_OP, Ordering::SeqCst);
        info!(chain = %self.config.chain, "consensus engine running");
        Ok(())
    }

    /// Drain in-flight polls (bounded by `max_item_processing_time`), stop
    /// the sweeper, and refuse further work. Idempotent.
    pub async fn stop(&self) -> Result<(), ConsensusError> {
        if self.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return Ok(());
        }
        let _ = self.shutdown.send(true);

        let deadline = Instant::now() + self.config.params.max_item_processing_time;
        while Instant::now() < deadline {
            if self.inner.lock().polls.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let leftovers = self.inner.lock().polls.drain();
        if !leftovers.is_empty() {
            warn!(polls = leftovers.len(), "force-closing polls at shutdown");
            self.finish_polls(leftovers);
        }
        info!(chain = %self.config.chain, "consensus engine stopped");
        Ok(())
    }

    /// Submit a decision. Applies backpressure once `max_outstanding_items`
    /// decisions are processing; polling is driven separately by
    /// [`ConsensusEngine::poll_tick`].
    pub fn add(&self, decision: Decision) -> Result<(), ConsensusError> {
        if self.state() == EngineState::Stopped {
            return Err(ConsensusError::NotRunning);
        }
        let mut inner = self.inner.lock();
        if inner.graph.num_processing() >= self.config.params.max_outstanding_items {
            return Err(ConsensusError::OutstandingLimit {
                limit: self.config.params.max_outstanding_items,
            });
        }
        inner.graph.insert(decision)?;
        Ok(())
    }

    /// Driver tick: issue polls for the current targets until every target
    /// has used its `concurrent_polls` budget. Returns how many polls were
    /// started.
    pub fn poll_tick(&self) -> usize {
        if self.state() != EngineState::NormalOp {
            return 0;
        }
        // Bound the tick: a poll that completes synchronously (every send
        // failing) frees its budget immediately and must not re-issue
        // within the same tick.
        let budget = {
            let inner = self.inner.lock();
            inner.graph.poll_targets().len() * self.config.params.concurrent_polls
        };
        let mut issued = 0;
        while issued < budget {
            // Snapshot membership per poll, outside the state lock; the
            // snapshot never changes mid-poll.
            let snapshot = self.validators.validators();
            let Some((poll_id, target, peers)) = self.plan_poll(snapshot) else {
                break;
            };
            issued += 1;

            let mut completed = Vec::new();
            for peer in peers {
                if let Err(err) = self.transport.send_vote_request(peer, poll_id, target) {
                    warn!(%peer, poll = poll_id, %err, "vote request failed; dropping peer");
                    if let Some(done) = self.inner.lock().polls.drop_peer(poll_id, peer) {
                        completed.push(done);
                    }
                }
            }
            self.finish_polls(completed);
        }
        issued
    }

    fn plan_poll(
        &self,
        snapshot: Vec<meridian_core::Validator>,
    ) -> Option<(u32, Id, Vec<NodeId>)> {
        let params = &self.config.params;
        let mut inner = self.inner.lock();

        let targets = inner.graph.poll_targets();
        let target = targets
            .into_iter()
            .find(|t| inner.polls.outstanding_for(t) < params.concurrent_polls)?;

        let sampler = WeightedSampler::new(snapshot);
        let peers = match sampler.sample(&mut inner.rng, params.k) {
            Ok(peers) => peers,
            Err(err) => {
                warn!(%err, "peer sampling failed; skipping tick");
                return None;
            }
        };

        match inner
            .polls
            .issue(target, peers.clone(), Instant::now(), self.config.poll_timeout)
        {
            Ok(poll_id) => Some((poll_id, target, peers)),
            Err(err) => {
                debug!(decision = %target, %err, "poll not issued");
                None
            }
        }
    }

    /// Route one vote reply into its poll. Unknown polls, peers outside the
    /// sample, and duplicates are dropped silently.
    pub fn record_reply(&self, poll_id: u32, from: NodeId, vote: Id) {
        let completed = {
            let mut inner = self.inner.lock();
            match inner.polls.record_reply(poll_id, from, vote) {
                ReplyOutcome::Completed(poll) => Some(poll),
                _ => None,
            }
        };
        if let Some(poll) = completed {
            self.finish_polls(vec![poll]);
        }
    }

    /// Terminate one poll now; its partial bag is processed like a normal
    /// completion.
    pub fn record_timeout(&self, poll_id: u32) {
        let timed_out = self.inner.lock().polls.timeout(poll_id);
        if let Some(poll) = timed_out {
            self.finish_polls(vec![poll]);
        }
    }

    /// Expire every overdue poll. Called periodically by the sweeper task;
    /// exposed for hosts that drive time themselves.
    pub fn sweep(&self) {
        let expired = self.inner.lock().polls.expire(Instant::now());
        self.finish_polls(expired);
    }

    fn finish_polls(&self, polls: Vec<Poll>) {
        if polls.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            for poll in polls {
                debug!(poll = poll.id, decision = %poll.target, replies = poll.replies.len(), "poll finished");
                let outcome = inner.graph.record_poll(poll.target, &poll.replies);
                self.polls_completed.fetch_add(1, Ordering::SeqCst);
                if !outcome.is_empty() {
                    // Queued under the state lock so commit order matches
                    // graph order exactly.
                    self.pending_commits.lock().push_back(outcome);
                }
            }
        }
        self.pump_commits();
    }

    fn pump_commits(&self) {
        let _guard = self.commit_lock.lock();
        loop {
            let Some(outcome) = self.pending_commits.lock().pop_front() else {
                break;
            };
            self.commit(outcome);
        }
    }

    fn commit(&self, outcome: PollOutcome) {
        if outcome.accepted.is_empty() {
            return;
        }

        let mut batch = WriteBatch::new();
        for decision in &outcome.accepted {
            let certificate = self.signer.as_ref().and_then(|signer| {
                match signer.sign(&decision.id) {
                    Ok(certificate) => Some(certificate.into_bytes()),
                    Err(err) => {
                        error!(id = %decision.id, %err, "certificate signing failed");
                        None
                    }
                }
            });
            let record = CommitRecord {
                id: decision.id,
                height: decision.height,
                parents: decision.parents.clone(),
                payload: decision.payload.clone(),
                certificate,
                accepted_at: Utc::now(),
            };
            match record.encode() {
                Ok(bytes) => batch.put(CommitRecord::key(&decision.id), bytes),
                Err(err) => error!(id = %decision.id, %err, "commit record encoding failed"),
            }
        }

        // Persistence strictly precedes notification: a decision an
        // acceptor has seen must survive a crash.
        if let Err(source) = self.store.apply_batch(batch) {
            error!(%source, "commit batch failed; acceptors not notified");
            let _ = self.fatal_tx.send(FatalError::StorageFailed {
                chain: self.config.chain,
                source,
            });
            return;
        }

        for decision in &outcome.accepted {
            self.acceptors
                .dispatch(self.config.chain, decision.id, &decision.payload, &self.fatal_tx);
            self.decisions_accepted.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_accepted(&self, id: &Id) -> bool {
        self.inner.lock().graph.is_accepted(id)
    }

    pub fn status(&self, id: &Id) -> meridian_core::DecisionStatus {
        self.inner.lock().graph.status(id)
    }

    pub fn preference(&self) -> Id {
        self.inner.lock().graph.preference()
    }

    pub fn num_processing(&self) -> usize {
        self.inner.lock().graph.num_processing()
    }

    pub fn processing(&self) -> Vec<Id> {
        self.inner.lock().graph.processing()
    }

    /// Look up a decision the engine has seen.
    pub fn decision(&self, id: &Id) -> Option<Decision> {
        self.inner.lock().graph.decision(id).cloned()
    }

    /// Run a closure against the graph under the state lock. Intended for
    /// variant-specific read-only queries (frontier, safe prefix, parent
    /// selection) without widening the engine surface per variant.
    pub fn with_graph<T>(&self, f: impl FnOnce(&mut G) -> T) -> T {
        f(&mut self.inner.lock().graph)
    }

    pub fn health_check(&self) -> HealthReport {
        let (processing, oldest_poll_age) = {
            let inner = self.inner.lock();
            (
                inner.graph.num_processing(),
                inner.polls.oldest_age(Instant::now()),
            )
        };
        let healthy = oldest_poll_age
            .map_or(true, |age| age <= self.config.params.max_item_processing_time);
        HealthReport {
            processing,
            oldest_poll_age,
            polls_completed: self.polls_completed.load(Ordering::SeqCst),
            decisions_accepted: self.decisions_accepted.load(Ordering::SeqCst),
            healthy,
        }
    }

    /// Take the fatal-error channel. Available once; the host should watch
    /// it and treat any message as grounds to halt the chain.
    pub fn fatal_events(&self) -> Option<mpsc::UnboundedReceiver<FatalError>> {
        self.fatal_rx.lock().take()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainGraph;
    use crate::transport::TransportError;
    use meridian_core::{DecisionStatus, StaticValidators};
    use meridian_storage::{load_commit, MemoryStore};

    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, u32, Id)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<(NodeId, u32, Id)> {
            self.sent.lock().clone()
        }
    }

    impl VoteTransport for RecordingTransport {
        fn send_vote_request(
            &self,
            to: NodeId,
            poll_id: u32,
            decision: Id,
        ) -> Result<(), TransportError> {
            self.sent.lock().push((to, poll_id, decision));
            Ok(())
        }
    }

    struct FailingTransport;

    impl VoteTransport for FailingTransport {
        fn send_vote_request(
            &self,
            to: NodeId,
            _poll_id: u32,
            _decision: Id,
        ) -> Result<(), TransportError> {
            Err(TransportError::Unreachable { peer: to })
        }
    }

    fn genesis() -> Decision {
        Decision::with_id(Id::ZERO, Vec::new(), 0, Vec::new())
    }

    fn block(parent: &Decision, tag: &[u8]) -> Decision {
        Decision::new(vec![parent.id], parent.height + 1, tag.to_vec())
    }

    fn test_params() -> Parameters {
        Parameters {
            k: 5,
            alpha_preference: 3,
            alpha_confidence: 4,
            beta: 2,
            concurrent_polls: 2,
            max_outstanding_items: 4,
            max_item_processing_time: Duration::from_secs(5),
            ..Parameters::default()
        }
    }

    fn build_engine(
        params: Parameters,
        transport: Arc<dyn VoteTransport>,
    ) -> (ChainEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            chain: Id::digest(b"testchain"),
            params: params.clone(),
            poll_timeout: Duration::from_secs(60),
            sample_seed: 42,
        };
        let engine = ConsensusEngine::new(
            config,
            ChainGraph::new(genesis(), params),
            transport,
            Arc::new(StaticValidators::uniform(8)),
            store.clone() as Arc<dyn CommitStore>,
            Arc::new(AcceptorRegistry::new()),
        )
        .unwrap();
        (engine, store)
    }

    /// Answer every outstanding request with a vote for `vote`.
    fn answer_all(engine: &ChainEngine, transport: &RecordingTransport, vote: Id) {
        let sent: Vec<(NodeId, u32, Id)> = transport.sent.lock().drain(..).collect();
        for (peer, poll_id, _) in sent {
            engine.record_reply(poll_id, peer, vote);
        }
    }

    #[tokio::test]
    async fn test_poll_tick_dispatches_k_requests_per_poll() {
        let transport = Arc::new(RecordingTransport::new());
        let (engine, _) = build_engine(test_params(), transport.clone());
        engine.start().await.unwrap();

        let b1 = block(&genesis(), b"one");
        engine.add(b1.clone()).unwrap();

        // concurrent_polls = 2, so one tick pipelines two polls of k peers.
        let issued = engine.poll_tick();
        assert_eq!(issued, 2);
        let sent = transport.sent();
        assert_eq!(sent.len(), 10);
        assert!(sent.iter().all(|(_, _, d)| *d == b1.id));

        // The budget is exhausted until something completes.
        assert_eq!(engine.poll_tick(), 0);
    }

    #[tokio::test]
    async fn test_replies_finalize_and_persist() {
        let transport = Arc::new(RecordingTransport::new());
        let (engine, store) = build_engine(test_params(), transport.clone());
        engine.start().await.unwrap();

        let b1 = block(&genesis(), b"one");
        engine.add(b1.clone()).unwrap();

        // beta = 2: two rounds of unanimous replies finalize the block.
        for _ in 0..2 {
            engine.poll_tick();
            answer_all(&engine, &transport, b1.id);
        }

        assert!(engine.is_accepted(&b1.id));
        assert_eq!(engine.num_processing(), 0);
        let record = load_commit(store.as_ref(), &b1.id).unwrap().unwrap();
        assert_eq!(record.payload, b"one");
        assert_eq!(record.height, 1);
        assert!(record.certificate.is_none());

        let health = engine.health_check();
        assert_eq!(health.decisions_accepted, 1);
        assert!(health.polls_completed >= 2);
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn test_acceptors_fire_after_persistence() {
        let transport = Arc::new(RecordingTransport::new());
        let store = Arc::new(MemoryStore::new());
        let acceptors = Arc::new(AcceptorRegistry::new());
        let params = test_params();
        let config = EngineConfig {
            chain: Id::digest(b"testchain"),
            params: params.clone(),
            poll_timeout: Duration::from_secs(60),
            sample_seed: 42,
        };

        let seen: Arc<Mutex<Vec<Id>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let probe_store = store.clone();
        acceptors.register(
            config.chain,
            "probe",
            Arc::new(move |_chain: Id, decision: Id, _payload: &[u8]| -> anyhow::Result<()> {
                // The record must already be durable when the hook runs.
                assert!(load_commit(probe_store.as_ref(), &decision).unwrap().is_some());
                sink.lock().push(decision);
                Ok(())
            }),
            true,
        );

        let engine = ConsensusEngine::new(
            config,
            ChainGraph::new(genesis(), params),
            transport.clone() as Arc<dyn VoteTransport>,
            Arc::new(StaticValidators::uniform(8)),
            store.clone() as Arc<dyn CommitStore>,
            acceptors,
        )
        .unwrap();
        engine.start().await.unwrap();

        let b1 = block(&genesis(), b"one");
        let b2 = block(&b1, b"two");
        engine.add(b1.clone()).unwrap();
        engine.add(b2.clone()).unwrap();

        // Poll the preferred tip (b2) to finality; b1 commits first.
        for _ in 0..2 {
            engine.poll_tick();
            answer_all(&engine, &transport, b2.id);
        }

        assert_eq!(*seen.lock(), vec![b1.id, b2.id]);
    }

    #[tokio::test]
    async fn test_outstanding_limit_backpressure() {
        let params = Parameters {
            max_outstanding_items: 2,
            ..test_params()
        };
        let transport = Arc::new(RecordingTransport::new());
        let (engine, _) = build_engine(params, transport.clone());
        engine.start().await.unwrap();

        let g = genesis();
        let b1 = block(&g, b"one");
        let b2 = block(&b1, b"two");
        let b3 = block(&b2, b"three");
        engine.add(b1.clone()).unwrap();
        engine.add(b2.clone()).unwrap();
        assert!(matches!(
            engine.add(b3.clone()),
            Err(ConsensusError::OutstandingLimit { limit: 2 })
        ));

        // Finalizing the chain frees the budget.
        for _ in 0..2 {
            engine.poll_tick();
            answer_all(&engine, &transport, b2.id);
        }
        assert!(engine.is_accepted(&b1.id));
        engine.add(b3).unwrap();
    }

    #[tokio::test]
    async fn test_failed_sends_drop_peers_and_complete_the_poll() {
        let params = test_params();
        let (engine, _) = build_engine(params, Arc::new(FailingTransport));
        engine.start().await.unwrap();

        let b1 = block(&genesis(), b"one");
        engine.add(b1.clone()).unwrap();

        // Every send fails, so each issued poll completes immediately with
        // an empty bag; the engine keeps running and nothing finalizes.
        let issued = engine.poll_tick();
        assert_eq!(issued, 2);
        let health = engine.health_check();
        assert_eq!(health.polls_completed, 2);
        assert!(!engine.is_accepted(&b1.id));
        assert_eq!(engine.status(&b1.id), DecisionStatus::Preferred);
    }

    #[tokio::test]
    async fn test_timeout_feeds_partial_bag() {
        let params = Parameters {
            beta: 1,
            concurrent_polls: 1,
            ..test_params()
        };
        let transport = Arc::new(RecordingTransport::new());
        let (engine, _) = build_engine(params, transport.clone());
        engine.start().await.unwrap();

        let b1 = block(&genesis(), b"one");
        engine.add(b1.clone()).unwrap();
        engine.poll_tick();

        // Four of five peers reply before the timeout; alpha_confidence = 4
        // is still met by the partial bag.
        let sent = transport.sent();
        let poll_id = sent[0].1;
        for (peer, poll, _) in sent.iter().take(4) {
            engine.record_reply(*poll, *peer, b1.id);
        }
        assert!(!engine.is_accepted(&b1.id));

        engine.record_timeout(poll_id);
        assert!(engine.is_accepted(&b1.id));
    }

    #[tokio::test]
    async fn test_duplicate_replies_are_noops() {
        let params = Parameters {
            beta: 1,
            concurrent_polls: 1,
            ..test_params()
        };
        let transport = Arc::new(RecordingTransport::new());
        let (engine, _) = build_engine(params, transport.clone());
        engine.start().await.unwrap();

        let b1 = block(&genesis(), b"one");
        engine.add(b1.clone()).unwrap();
        engine.poll_tick();

        let sent = transport.sent();
        let (first_peer, poll_id, _) = sent[0];
        for _ in 0..10 {
            engine.record_reply(poll_id, first_peer, b1.id);
        }
        // Nine duplicates counted nothing: the poll is still open.
        assert_eq!(engine.health_check().polls_completed, 0);

        for (peer, poll, _) in sent.iter().skip(1) {
            engine.record_reply(*poll, *peer, b1.id);
        }
        assert_eq!(engine.health_check().polls_completed, 1);
        assert!(engine.is_accepted(&b1.id));
    }

    #[tokio::test]
    async fn test_lifecycle_and_bootstrap() {
        let transport = Arc::new(RecordingTransport::new());
        let (engine, _) = build_engine(test_params(), transport.clone());
        let (trigger, signal) = BootstrapSignal::pending();
        let engine = engine.with_bootstrap(signal);
        assert_eq!(engine.state(), EngineState::Created);

        // No polls before normal operation.
        engine.add(block(&genesis(), b"one")).unwrap();
        assert_eq!(engine.poll_tick(), 0);

        let starter = engine.clone();
        let handle = tokio::spawn(async move { starter.start().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.state(), EngineState::Bootstrapping);

        trigger.fire();
        handle.await.unwrap().unwrap();
        assert_eq!(engine.state(), EngineState::NormalOp);
        assert!(engine.poll_tick() > 0);

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(
            engine.add(block(&genesis(), b"late")),
            Err(ConsensusError::NotRunning)
        ));
        // Stop is idempotent, start afterwards is refused.
        engine.stop().await.unwrap();
        assert!(engine.start().await.is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_when_a_poll_outlives_the_limit() {
        let params = Parameters {
            max_item_processing_time: Duration::from_millis(20),
            ..test_params()
        };
        let transport = Arc::new(RecordingTransport::new());
        let (engine, _) = build_engine(params, transport.clone());
        engine.start().await.unwrap();

        engine.add(block(&genesis(), b"one")).unwrap();
        engine.poll_tick();
        assert!(engine.health_check().healthy);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!engine.health_check().healthy);
    }

    #[tokio::test]
    async fn test_certificates_attached_when_signer_configured() {
        use crate::certificates::{CertificateVerifier, Ed25519Signer, Ed25519Verifier};

        let params = Parameters {
            beta: 1,
            ..test_params()
        };
        let transport = Arc::new(RecordingTransport::new());
        let (engine, store) = build_engine(params, transport.clone());
        let signer = Arc::new(Ed25519Signer::from_seed([9u8; 32]));
        let verifier = Ed25519Verifier::new(signer.verifying_key());
        let engine = engine.with_certificate_signer(signer);
        engine.start().await.unwrap();

        let b1 = block(&genesis(), b"one");
        engine.add(b1.clone()).unwrap();
        engine.poll_tick();
        answer_all(&engine, &transport, b1.id);

        let record = load_commit(store.as_ref(), &b1.id).unwrap().unwrap();
        let certificate =
            crate::certificates::Certificate::from_bytes(record.certificate.unwrap()).unwrap();
        verifier.verify(&b1.id, &certificate).unwrap();
    }
}
