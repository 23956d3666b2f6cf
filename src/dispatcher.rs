//! # Action Dispatcher
//!
//! The outbound side of a node. Inbound handlers only queue [`Action`]s;
//! a single dispatcher task takes them oldest first and carries each one
//! out through the [`Gateway`]. Actions run one at a time, and a remote
//! that stays unavailable after the gateway's retries costs only that
//! action: it is logged and dropped, and the dispatcher moves on.
//!
//! | Action | Outbound calls |
//! |--------|----------------|
//! | `Greet(addr)` | `addr.ping(self)` |
//! | `Propagate(p)` | `p.pong(self)`, then `q.ping(p)` for every other known `q` |
//! | `QueryNeighbourStatus(p)` | `p.neighbourRequest(self)` while we have spare slots |
//! | `ForwardFlood { .. }` | `target.find(query)` |
//! | `ForwardWalk { .. }` | `target.walkerFind(query, visited)` |
//! | `ReportFound { .. }` | `requester.found(msg_id, self)` |

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::gateway::Gateway;
use crate::identity::PeerIdentity;
use crate::messages::{MessageId, Query};
use crate::overlay::Overlay;
use crate::protocols::OverlayRpc;

/// Default sleep between polls of an empty queue.
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(50);

/// One unit of outbound work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Announce ourselves to a bootstrap address.
    Greet(String),
    /// Answer a new peer and announce it to everyone else we know.
    Propagate(PeerIdentity),
    /// Ask a peer to become our neighbour.
    QueryNeighbourStatus(PeerIdentity),
    ForwardFlood {
        target: PeerIdentity,
        query: Query,
    },
    ForwardWalk {
        target: PeerIdentity,
        query: Query,
        visited: Vec<String>,
    },
    ReportFound {
        requester: String,
        msg_id: MessageId,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Greet(_) => "greet",
            Action::Propagate(_) => "propagate",
            Action::QueryNeighbourStatus(_) => "query_neighbour_status",
            Action::ForwardFlood { .. } => "forward_flood",
            Action::ForwardWalk { .. } => "forward_walk",
            Action::ReportFound { .. } => "report_found",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub idle_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

impl DispatcherConfig {
    /// A zero idle poll would spin on an empty queue.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.idle_poll.is_zero(), "dispatcher idle poll must be positive");
        Ok(())
    }
}

pub struct Dispatcher<N: OverlayRpc> {
    overlay: Overlay,
    gateway: Gateway<N>,
    config: DispatcherConfig,
}

impl<N: OverlayRpc> Dispatcher<N> {
    pub fn new(overlay: Overlay, gateway: Gateway<N>, config: DispatcherConfig) -> Self {
        Self {
            overlay,
            gateway,
            config,
        }
    }

    /// Run the dispatcher until the overlay actor shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        loop {
            match self.overlay.next_action().await {
                Ok(Some(action)) => {
                    let kind = action.kind();
                    if let Err(e) = self.execute(action).await {
                        debug!(action = kind, error = %e, "action dropped");
                    }
                }
                Ok(None) => tokio::time::sleep(self.config.idle_poll).await,
                Err(_) => {
                    debug!(node = %self.overlay.identity(), "overlay closed, dispatcher stopping");
                    break;
                }
            }
        }
    }

    /// Carry out one action. An error means the action was abandoned.
    pub async fn execute(&self, action: Action) -> anyhow::Result<()> {
        let local = self.overlay.identity();
        let net = self.gateway.network();
        trace!(action = action.kind(), "dispatching");

        match action {
            Action::Greet(addr) => {
                self.gateway.call(&addr, "ping", || net.ping(&addr, local)).await?;
            }
            Action::Propagate(subject) => {
                let addr = subject.address();
                self.gateway.call(&addr, "pong", || net.pong(&addr, local)).await?;

                for peer in self.overlay.gossip_targets(subject.clone()).await? {
                    let to = peer.address();
                    if let Err(e) = self.gateway.call(&to, "ping", || net.ping(&to, &subject)).await {
                        debug!(peer = %to, subject = %subject, error = %e, "gossip ping failed");
                    }
                }
            }
            Action::QueryNeighbourStatus(target) => {
                if !self.overlay.has_spare_capacity().await? {
                    trace!(peer = %target, "no spare neighbour slots");
                    return Ok(());
                }
                let addr = target.address();
                let (accepted, peer) = self
                    .gateway
                    .call(&addr, "neighbourRequest", || net.neighbour_request(&addr, local))
                    .await?;
                if accepted {
                    self.overlay.add_neighbour(peer).await?;
                } else {
                    debug!(peer = %peer, "neighbour request declined");
                }
            }
            Action::ForwardFlood { target, query } => {
                let addr = target.address();
                self.gateway.call(&addr, "find", || net.find(&addr, &query)).await?;
            }
            Action::ForwardWalk { target, query, visited } => {
                let addr = target.address();
                self.gateway
                    .call(&addr, "walkerFind", || net.walker_find(&addr, &query, &visited))
                    .await?;
            }
            Action::ReportFound { requester, msg_id } => {
                let holder = local.address();
                self.gateway
                    .call(&requester, "found", || net.found(&requester, msg_id, &holder))
                    .await?;
            }
        }
        Ok(())
    }
}
