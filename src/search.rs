//! # Search Engine
//!
//! File-existence search over the neighbour graph, in two strategies:
//!
//! - **Flood**: every hop forwards the query to all of its neighbours.
//! - **Random walk**: `k` walkers each forward to one neighbour per hop,
//!   preferring neighbours they have not visited yet.
//!
//! Both are bounded by the query's `ttl` and deduplicated by message id: a
//! node processes a given search at most once and only counts later
//! arrivals. The per-hop rules in this module are pure. They read and
//! update the node's ledgers and return the [`Action`]s to enqueue; none of
//! them touches the network.
//!
//! [`originate`] is the caller side: submit the search to the local node,
//! poll for a holder within a bounded wait, then add up how many messages
//! the search cost across every known peer.

use std::time::Duration;

use rand::Rng;
use rand::seq::{IteratorRandom, SliceRandom};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::dispatcher::Action;
use crate::gateway::Gateway;
use crate::identity::PeerIdentity;
use crate::ledger::{FileStore, MessageLedger, NeighbourSet, Sighting};
use crate::messages::{MAX_VISITED, MAX_WALKERS, MessageId, Query};
use crate::overlay::Overlay;
use crate::protocols::OverlayRpc;

/// Default hop budget for searches started from the shell.
pub const DEFAULT_TTL: u32 = 4;

/// Default number of random walkers.
pub const DEFAULT_WALKERS: u32 = 2;

/// Default delay between two `hasFoundFile` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Flood,
    RandomWalk { walkers: u32 },
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub poll_interval: Duration,
    pub default_ttl: u32,
    pub default_walkers: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_ttl: DEFAULT_TTL,
            default_walkers: DEFAULT_WALKERS,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.poll_interval.is_zero(), "search poll interval must be positive");
        anyhow::ensure!(self.default_ttl > 0, "default search ttl must be positive");
        anyhow::ensure!(
            (1..=MAX_WALKERS).contains(&self.default_walkers),
            "default walker count must be between 1 and {}",
            MAX_WALKERS
        );
        Ok(())
    }
}

/// Result of one originated search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchOutcome {
    pub msg_id: MessageId,
    pub found: bool,
    /// Address of the first node that reported the file.
    pub holder: Option<String>,
    /// Arrivals of this search summed over the local node and every known peer.
    pub messages: u64,
}

// ============================================================================
// Per-hop rules
// ============================================================================

/// Borrowed view of the node state a search hop reads and updates.
pub(crate) struct SearchContext<'a, R: Rng> {
    pub local: &'a PeerIdentity,
    pub files: &'a FileStore,
    pub neighbours: &'a NeighbourSet,
    pub messages: &'a mut MessageLedger,
    pub rng: &'a mut R,
}

/// How a query arriving at this node is handled before any forwarding.
enum Arrival {
    /// ttl is spent; nothing was recorded.
    Expired,
    /// Already processed here; the hit was counted.
    Repeat,
    /// We hold the file; the holder is recorded.
    Held(Vec<Action>),
    /// First sighting of a file we do not have.
    Forward,
}

impl<'a, R: Rng> SearchContext<'a, R> {
    fn arrive(&mut self, query: &Query) -> Arrival {
        if query.is_expired() {
            trace!(msg_id = query.msg_id, "query expired");
            return Arrival::Expired;
        }

        let local_address = self.local.address();
        let from_network = query.requester != local_address;
        if self.messages.observe(query.msg_id, from_network) == Sighting::Repeat {
            trace!(msg_id = query.msg_id, hits = self.messages.hits(query.msg_id), "duplicate query");
            return Arrival::Repeat;
        }

        if !self.files.contains(&query.file_name) {
            return Arrival::Forward;
        }

        debug!(msg_id = query.msg_id, file = %query.file_name, "file held locally");
        self.messages.record_found(query.msg_id, &local_address);
        let mut actions = Vec::new();
        if from_network {
            actions.push(Action::ReportFound {
                requester: query.requester.clone(),
                msg_id: query.msg_id,
            });
        }
        Arrival::Held(actions)
    }

    /// One flood hop. Returns whether the file was found here.
    pub fn flood_find(&mut self, query: &Query) -> (bool, Vec<Action>) {
        match self.arrive(query) {
            Arrival::Expired | Arrival::Repeat => (false, Vec::new()),
            Arrival::Held(actions) => (true, actions),
            Arrival::Forward => {
                let next = query.next_hop();
                let actions = self
                    .neighbours
                    .iter()
                    .map(|n| Action::ForwardFlood {
                        target: n.clone(),
                        query: next.clone(),
                    })
                    .collect();
                (false, actions)
            }
        }
    }

    /// Launch `walkers` random walks from this node, at most [`MAX_WALKERS`].
    pub fn start_walk(&mut self, query: &Query, walkers: u32) -> (bool, Vec<Action>) {
        match self.arrive(query) {
            Arrival::Expired | Arrival::Repeat => (false, Vec::new()),
            Arrival::Held(actions) => (true, actions),
            Arrival::Forward => {
                let next = query.next_hop();
                let local_address = self.local.address();
                let actions = self
                    .pick_walkers(walkers.min(MAX_WALKERS) as usize)
                    .into_iter()
                    .map(|target| {
                        let visited = vec![local_address.clone(), target.address()];
                        Action::ForwardWalk {
                            target,
                            query: next.clone(),
                            visited,
                        }
                    })
                    .collect();
                (false, actions)
            }
        }
    }

    /// One random-walk hop: forward to a single neighbour, unvisited if possible.
    pub fn walker_find(&mut self, query: &Query, visited: &[String]) -> (bool, Vec<Action>) {
        match self.arrive(query) {
            Arrival::Expired | Arrival::Repeat => (false, Vec::new()),
            Arrival::Held(actions) => (true, actions),
            Arrival::Forward => {
                let Some(target) = self.next_walker_hop(visited) else {
                    return (false, Vec::new());
                };

                let mut path = visited.to_vec();
                if path.len() >= MAX_VISITED {
                    path.drain(..=path.len() - MAX_VISITED);
                }
                path.push(target.address());

                let action = Action::ForwardWalk {
                    target,
                    query: query.next_hop(),
                    visited: path,
                };
                (false, vec![action])
            }
        }
    }

    /// `k` neighbours: distinct when there are at least `k`, with repeats otherwise.
    fn pick_walkers(&mut self, k: usize) -> Vec<PeerIdentity> {
        let members = self.neighbours.list();
        if members.is_empty() || k == 0 {
            return Vec::new();
        }
        if members.len() >= k {
            members.choose_multiple(&mut *self.rng, k).cloned().collect()
        } else {
            (0..k)
                .filter_map(|_| members.choose(&mut *self.rng).cloned())
                .collect()
        }
    }

    fn next_walker_hop(&mut self, visited: &[String]) -> Option<PeerIdentity> {
        let unvisited = self
            .neighbours
            .iter()
            .filter(|n| !visited.contains(&n.address()))
            .choose(&mut *self.rng);

        unvisited
            .or_else(|| self.neighbours.iter().choose(&mut *self.rng))
            .cloned()
    }
}

// ============================================================================
// Origination
// ============================================================================

/// Run a search from `overlay`'s own node and report its outcome.
///
/// The local node is asked directly. When it does not hold the file itself,
/// `hasFoundFile` is polled every `poll_interval`, at most `ttl` times and
/// never longer than `ttl × poll_interval` in total. The message count then
/// adds the local count to `getNumSearchMessages` of every known peer;
/// peers that cannot be reached through `gateway` count as zero.
pub async fn originate<N: OverlayRpc>(
    overlay: &Overlay,
    gateway: &Gateway<N>,
    config: &SearchConfig,
    file_name: &str,
    ttl: u32,
    strategy: Strategy,
) -> anyhow::Result<SearchOutcome> {
    let local = overlay.identity().clone();
    let msg_id: MessageId = rand::random();
    let query = Query::new(local.address(), msg_id, file_name, ttl);

    debug!(msg_id, file = %file_name, ttl, ?strategy, "originating search");
    let found_locally = match strategy {
        Strategy::Flood => overlay.find(query).await?,
        Strategy::RandomWalk { walkers } => overlay.start_walk(query, walkers).await?,
    };

    if !found_locally {
        let wait = config.poll_interval.saturating_mul(ttl);
        let polling = async {
            for _ in 0..ttl {
                tokio::time::sleep(config.poll_interval).await;
                if overlay.has_found_file(msg_id).await?.found {
                    return anyhow::Ok(());
                }
            }
            Ok(())
        };
        if let Ok(Err(e)) = tokio::time::timeout(wait, polling).await {
            return Err(e);
        }
    }

    let status = overlay.has_found_file(msg_id).await?;
    let messages = count_messages(overlay, gateway, msg_id).await?;

    Ok(SearchOutcome {
        msg_id,
        found: status.found,
        holder: status.found.then_some(status.holder),
        messages,
    })
}

async fn count_messages<N: OverlayRpc>(
    overlay: &Overlay,
    gateway: &Gateway<N>,
    msg_id: MessageId,
) -> anyhow::Result<u64> {
    let mut total = overlay.search_messages(msg_id).await?;

    let mut join_set = JoinSet::new();
    for peer in overlay.plist().await? {
        let gateway = gateway.clone();
        join_set.spawn(async move {
            let addr = peer.address();
            let network = gateway.network();
            gateway
                .call(&addr, "getNumSearchMessages", || network.search_messages(&addr, msg_id))
                .await
                .unwrap_or(0)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        total += joined.unwrap_or(0);
    }
    Ok(total)
}
