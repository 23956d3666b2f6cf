//! # Overlay Node State
//!
//! The inbound side of a node: every RPC a peer can issue lands on an
//! [`Overlay`] handle. Handlers validate their input, update the local
//! ledgers and enqueue follow-up [`Action`]s; they never wait on the
//! network. The [`crate::dispatcher::Dispatcher`] drains the queue.
//!
//! ## Architecture
//!
//! ```text
//! RPC server ──┐                       ┌── PeerLedger
//! Dispatcher ──┼─► Overlay (handle) ──►│   NeighbourSet
//! Node API   ──┘     mpsc::Sender      │   MessageLedger
//!                                      │   FileStore
//!                   OverlayActor ──────┘   action queue
//! ```
//!
//! All state lives in a single actor task. Commands are applied one at a
//! time in arrival order, so handlers and the dispatcher never observe a
//! partial update.
//!
//! ## Gossip
//!
//! - `ping(from)`: an unknown peer is recorded and a `Propagate(from)` is
//!   queued (pong back, then announce `from` to every other known peer).
//! - `pong(from)`: the peer is recorded and a `QueryNeighbourStatus(from)`
//!   is queued (ask it for adjacency while we have spare slots).

use std::collections::VecDeque;

use anyhow::anyhow;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::admission::{DEFAULT_ACCEPT_THRESHOLD, accept_neighbour};
use crate::dispatcher::Action;
use crate::identity::PeerIdentity;
use crate::ledger::{DEFAULT_MAX_TRACKED_SEARCHES, FileStore, MessageLedger, NeighbourSet, PeerLedger};
use crate::messages::{FILE_NOT_FOUND, MessageId, Query, SearchStatus};
use crate::search::SearchContext;

/// Default bound on queued, not yet dispatched actions.
/// SECURITY: A flood of pings from distinct identities must not exhaust memory.
pub const DEFAULT_MAX_PENDING_ACTIONS: usize = 10_000;

#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// Threshold of the probabilistic neighbour admission. 0 accepts whenever there is room.
    pub accept_threshold: f64,
    pub max_tracked_searches: usize,
    pub max_pending_actions: usize,
    /// Fixed RNG seed for reproducible walks and admissions.
    pub rng_seed: Option<u64>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            max_tracked_searches: DEFAULT_MAX_TRACKED_SEARCHES,
            max_pending_actions: DEFAULT_MAX_PENDING_ACTIONS,
            rng_seed: None,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.accept_threshold.is_finite() && (0.0..=2.0).contains(&self.accept_threshold),
            "accept threshold must be within [0, 2], got {}",
            self.accept_threshold
        );
        anyhow::ensure!(self.max_tracked_searches > 0, "max tracked searches must be positive");
        anyhow::ensure!(self.max_pending_actions > 0, "max pending actions must be positive");
        Ok(())
    }
}

// ============================================================================
// State
// ============================================================================

/// Everything one node knows, mutated only from the actor.
pub(crate) struct OverlayState {
    local: PeerIdentity,
    peers: PeerLedger,
    neighbours: NeighbourSet,
    messages: MessageLedger,
    files: FileStore,
    actions: VecDeque<Action>,
    rng: StdRng,
    config: OverlayConfig,
}

impl OverlayState {
    pub fn new(local: PeerIdentity, files: FileStore, config: OverlayConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            peers: PeerLedger::new(local.clone()),
            neighbours: NeighbourSet::new(local.capacity()),
            messages: MessageLedger::new(config.max_tracked_searches),
            local,
            files,
            actions: VecDeque::new(),
            rng,
            config,
        }
    }

    fn enqueue(&mut self, actions: impl IntoIterator<Item = Action>) {
        for action in actions {
            if self.actions.len() >= self.config.max_pending_actions {
                warn!(pending = self.actions.len(), action = action.kind(), "action queue full, dropping");
                continue;
            }
            self.actions.push_back(action);
        }
    }

    fn search(&mut self) -> SearchContext<'_, StdRng> {
        SearchContext {
            local: &self.local,
            files: &self.files,
            neighbours: &self.neighbours,
            messages: &mut self.messages,
            rng: &mut self.rng,
        }
    }

    /// Queue a greeting to `addr`. Greeting ourselves is refused.
    pub fn hello(&mut self, addr: &str) -> bool {
        if addr == self.local.address() {
            debug!(addr = %addr, "ignoring hello towards self");
            return false;
        }
        self.enqueue([Action::Greet(addr.to_string())]);
        true
    }

    pub fn observe_ping(&mut self, from: &PeerIdentity) -> bool {
        if self.peers.observe(from) {
            info!(peer = %from, known = self.peers.len(), "discovered peer");
            self.enqueue([Action::Propagate(from.clone())]);
        }
        true
    }

    pub fn observe_pong(&mut self, from: &PeerIdentity) -> bool {
        if self.peers.is_local(from) {
            return true;
        }
        if self.peers.observe(from) {
            info!(peer = %from, known = self.peers.len(), "discovered peer");
        }
        self.enqueue([Action::QueryNeighbourStatus(from.clone())]);
        true
    }

    pub fn neighbour_request(&mut self, candidate: &PeerIdentity) -> (bool, PeerIdentity) {
        if self.peers.is_local(candidate) {
            return (false, self.local.clone());
        }
        self.peers.observe(candidate);
        if self.neighbours.contains(candidate) {
            return (true, self.local.clone());
        }

        let accepted = accept_neighbour(
            &mut self.rng,
            self.local.capacity(),
            self.neighbours.len(),
            candidate.capacity(),
            self.config.accept_threshold,
        ) && self.neighbours.add(candidate.clone());

        if accepted {
            info!(peer = %candidate, neighbours = self.neighbours.len(), "admitted neighbour");
        } else {
            debug!(peer = %candidate, neighbours = self.neighbours.len(), "declined neighbour");
        }
        (accepted, self.local.clone())
    }

    /// Add a peer that accepted our own request. Bounded by capacity.
    pub fn add_neighbour(&mut self, peer: PeerIdentity) -> bool {
        if self.peers.is_local(&peer) {
            return false;
        }
        self.peers.observe(&peer);
        let added = self.neighbours.add(peer.clone());
        if added {
            info!(peer = %peer, neighbours = self.neighbours.len(), "neighbour accepted us");
        }
        added
    }

    pub fn find(&mut self, query: &Query) -> bool {
        let (found, actions) = self.search().flood_find(query);
        self.enqueue(actions);
        found
    }

    pub fn start_walk(&mut self, query: &Query, walkers: u32) -> bool {
        let (found, actions) = self.search().start_walk(query, walkers);
        self.enqueue(actions);
        found
    }

    pub fn walker_find(&mut self, query: &Query, visited: &[String]) -> bool {
        let (found, actions) = self.search().walker_find(query, visited);
        self.enqueue(actions);
        found
    }

    pub fn found(&mut self, msg_id: MessageId, holder: &str) -> bool {
        if self.messages.record_found(msg_id, holder) {
            info!(msg_id, holder = %holder, "search answered");
        } else {
            trace!(msg_id, holder = %holder, "late found report ignored");
        }
        true
    }

    pub fn has_found_file(&self, msg_id: MessageId) -> SearchStatus {
        self.messages.status(msg_id)
    }

    pub fn search_messages(&self, msg_id: MessageId) -> u64 {
        self.messages.hits(msg_id)
    }

    pub fn get(&self, file_name: &str) -> String {
        self.files
            .get(file_name)
            .unwrap_or(FILE_NOT_FOUND)
            .to_string()
    }

    pub fn share(&mut self, name: String, content: String) {
        self.files.insert(name, content);
    }

    pub fn next_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.neighbours.has_spare_capacity()
    }

    /// Known peers to announce `subject` to.
    pub fn gossip_targets(&self, subject: &PeerIdentity) -> Vec<PeerIdentity> {
        self.peers.others(subject)
    }

    pub fn plist(&self) -> Vec<PeerIdentity> {
        self.peers.list()
    }

    pub fn nlist(&self) -> Vec<PeerIdentity> {
        self.neighbours.list()
    }

    pub fn pending_actions(&self) -> usize {
        self.actions.len()
    }
}

// ============================================================================
// Actor and handle
// ============================================================================

enum Command {
    Hello(String, oneshot::Sender<bool>),
    Ping(PeerIdentity, oneshot::Sender<bool>),
    Pong(PeerIdentity, oneshot::Sender<bool>),
    PeerList(oneshot::Sender<Vec<PeerIdentity>>),
    NeighbourList(oneshot::Sender<Vec<PeerIdentity>>),
    NeighbourRequest(PeerIdentity, oneshot::Sender<(bool, PeerIdentity)>),
    Find(Query, oneshot::Sender<bool>),
    StartWalk(Query, u32, oneshot::Sender<bool>),
    WalkerFind(Query, Vec<String>, oneshot::Sender<bool>),
    Found(MessageId, String, oneshot::Sender<bool>),
    HasFoundFile(MessageId, oneshot::Sender<SearchStatus>),
    SearchMessages(MessageId, oneshot::Sender<u64>),
    Get(String, oneshot::Sender<String>),
    Share(String, String),

    NextAction(oneshot::Sender<Option<Action>>),
    HasSpareCapacity(oneshot::Sender<bool>),
    AddNeighbour(PeerIdentity, oneshot::Sender<bool>),
    GossipTargets(PeerIdentity, oneshot::Sender<Vec<PeerIdentity>>),
    PendingActions(oneshot::Sender<usize>),

    Quit,
}

/// Cloneable handle to a node's overlay state.
#[derive(Clone)]
pub struct Overlay {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerIdentity,
}

impl Overlay {
    pub fn spawn(local: PeerIdentity, files: FileStore, config: OverlayConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1000);
        let actor = OverlayActor {
            state: OverlayState::new(local.clone(), files, config),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx, local }
    }

    /// This node's own identity (`who`).
    pub fn identity(&self) -> &PeerIdentity {
        &self.local
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("overlay actor closed"))?;
        rx.await.map_err(|_| anyhow!("overlay actor closed"))
    }

    pub async fn hello(&self, addr: &str) -> anyhow::Result<bool> {
        self.request(|tx| Command::Hello(addr.to_string(), tx)).await
    }

    pub async fn ping(&self, from: PeerIdentity) -> anyhow::Result<bool> {
        self.request(|tx| Command::Ping(from, tx)).await
    }

    pub async fn pong(&self, from: PeerIdentity) -> anyhow::Result<bool> {
        self.request(|tx| Command::Pong(from, tx)).await
    }

    pub async fn plist(&self) -> anyhow::Result<Vec<PeerIdentity>> {
        self.request(Command::PeerList).await
    }

    pub async fn nlist(&self) -> anyhow::Result<Vec<PeerIdentity>> {
        self.request(Command::NeighbourList).await
    }

    pub async fn neighbour_request(&self, candidate: PeerIdentity) -> anyhow::Result<(bool, PeerIdentity)> {
        self.request(|tx| Command::NeighbourRequest(candidate, tx)).await
    }

    pub async fn find(&self, query: Query) -> anyhow::Result<bool> {
        self.request(|tx| Command::Find(query, tx)).await
    }

    pub async fn start_walk(&self, query: Query, walkers: u32) -> anyhow::Result<bool> {
        self.request(|tx| Command::StartWalk(query, walkers, tx)).await
    }

    pub async fn walker_find(&self, query: Query, visited: Vec<String>) -> anyhow::Result<bool> {
        self.request(|tx| Command::WalkerFind(query, visited, tx)).await
    }

    pub async fn found(&self, msg_id: MessageId, holder: String) -> anyhow::Result<bool> {
        self.request(|tx| Command::Found(msg_id, holder, tx)).await
    }

    pub async fn has_found_file(&self, msg_id: MessageId) -> anyhow::Result<SearchStatus> {
        self.request(|tx| Command::HasFoundFile(msg_id, tx)).await
    }

    pub async fn search_messages(&self, msg_id: MessageId) -> anyhow::Result<u64> {
        self.request(|tx| Command::SearchMessages(msg_id, tx)).await
    }

    pub async fn get(&self, file_name: &str) -> anyhow::Result<String> {
        self.request(|tx| Command::Get(file_name.to_string(), tx)).await
    }

    pub async fn share(&self, name: impl Into<String>, content: impl Into<String>) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Share(name.into(), content.into()))
            .await
            .map_err(|_| anyhow!("overlay actor closed"))
    }

    /// Pop the oldest queued action.
    pub async fn next_action(&self) -> anyhow::Result<Option<Action>> {
        self.request(Command::NextAction).await
    }

    pub async fn has_spare_capacity(&self) -> anyhow::Result<bool> {
        self.request(Command::HasSpareCapacity).await
    }

    pub async fn add_neighbour(&self, peer: PeerIdentity) -> anyhow::Result<bool> {
        self.request(|tx| Command::AddNeighbour(peer, tx)).await
    }

    pub async fn gossip_targets(&self, subject: PeerIdentity) -> anyhow::Result<Vec<PeerIdentity>> {
        self.request(|tx| Command::GossipTargets(subject, tx)).await
    }

    pub async fn pending_actions(&self) -> anyhow::Result<usize> {
        self.request(Command::PendingActions).await
    }

    /// Stop the actor. Later calls on any clone of this handle fail.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct OverlayActor {
    state: OverlayState,
    cmd_rx: mpsc::Receiver<Command>,
}

impl OverlayActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            let state = &mut self.state;
            match cmd {
                Command::Hello(addr, reply) => {
                    let _ = reply.send(state.hello(&addr));
                }
                Command::Ping(from, reply) => {
                    let _ = reply.send(state.observe_ping(&from));
                }
                Command::Pong(from, reply) => {
                    let _ = reply.send(state.observe_pong(&from));
                }
                Command::PeerList(reply) => {
                    let _ = reply.send(state.plist());
                }
                Command::NeighbourList(reply) => {
                    let _ = reply.send(state.nlist());
                }
                Command::NeighbourRequest(candidate, reply) => {
                    let _ = reply.send(state.neighbour_request(&candidate));
                }
                Command::Find(query, reply) => {
                    let _ = reply.send(state.find(&query));
                }
                Command::StartWalk(query, walkers, reply) => {
                    let _ = reply.send(state.start_walk(&query, walkers));
                }
                Command::WalkerFind(query, visited, reply) => {
                    let _ = reply.send(state.walker_find(&query, &visited));
                }
                Command::Found(msg_id, holder, reply) => {
                    let _ = reply.send(state.found(msg_id, &holder));
                }
                Command::HasFoundFile(msg_id, reply) => {
                    let _ = reply.send(state.has_found_file(msg_id));
                }
                Command::SearchMessages(msg_id, reply) => {
                    let _ = reply.send(state.search_messages(msg_id));
                }
                Command::Get(file_name, reply) => {
                    let _ = reply.send(state.get(&file_name));
                }
                Command::Share(name, content) => {
                    state.share(name, content);
                }
                Command::NextAction(reply) => {
                    let _ = reply.send(state.next_action());
                }
                Command::HasSpareCapacity(reply) => {
                    let _ = reply.send(state.has_spare_capacity());
                }
                Command::AddNeighbour(peer, reply) => {
                    let _ = reply.send(state.add_neighbour(peer));
                }
                Command::GossipTargets(subject, reply) => {
                    let _ = reply.send(state.gossip_targets(&subject));
                }
                Command::PendingActions(reply) => {
                    let _ = reply.send(state.pending_actions());
                }
                Command::Quit => {
                    debug!(node = %state.local, "overlay actor shutting down");
                    break;
                }
            }
        }
    }
}
