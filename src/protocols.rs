//! Protocol trait for the overlay's outbound RPC surface.
//!
//! [`OverlayRpc`] abstracts over the transport that carries requests to a
//! remote node's inbound handlers. The dispatcher, the gateway and the
//! search originator depend only on this trait, which lets the core run
//! against the TCP transport ([`crate::rpc::RpcNode`]) or an in-memory
//! network in tests.
//!
//! Every method addresses its target by `host:port`.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::PeerIdentity;
use crate::messages::{MessageId, Query, SearchStatus};

#[async_trait]
pub trait OverlayRpc: Send + Sync + 'static {
    /// Ask `to` to greet `addr` (it will ping `addr` with its own identity).
    async fn hello(&self, to: &str, addr: &str) -> Result<bool>;

    /// Announce `who` to `to`.
    async fn ping(&self, to: &str, who: &PeerIdentity) -> Result<bool>;

    /// Answer a ping: `who` is the responding node.
    async fn pong(&self, to: &str, who: &PeerIdentity) -> Result<bool>;

    async fn who(&self, to: &str) -> Result<PeerIdentity>;

    /// Peers known to `to`, ordered by name.
    async fn plist(&self, to: &str) -> Result<Vec<PeerIdentity>>;

    /// Overlay neighbours of `to`, in admission order.
    async fn nlist(&self, to: &str) -> Result<Vec<PeerIdentity>>;

    /// Ask `to` to admit `candidate` as a neighbour.
    /// Returns whether it accepted, along with its own identity.
    async fn neighbour_request(&self, to: &str, candidate: &PeerIdentity) -> Result<(bool, PeerIdentity)>;

    /// Deliver one flood-search hop.
    async fn find(&self, to: &str, query: &Query) -> Result<bool>;

    /// Start a random-walk search with `walkers` independent walkers on `to`.
    async fn start_walk(&self, to: &str, query: &Query, walkers: u32) -> Result<bool>;

    /// Deliver one random-walk hop.
    async fn walker_find(&self, to: &str, query: &Query, visited: &[String]) -> Result<bool>;

    /// Report to the originator `to` that `holder` has the file.
    async fn found(&self, to: &str, msg_id: MessageId, holder: &str) -> Result<bool>;

    async fn has_found_file(&self, to: &str, msg_id: MessageId) -> Result<SearchStatus>;

    /// Number of times the search `msg_id` reached `to` over the network.
    async fn search_messages(&self, to: &str, msg_id: MessageId) -> Result<u64>;

    /// Fetch a file; returns [`crate::messages::FILE_NOT_FOUND`] when absent.
    async fn get(&self, to: &str, file_name: &str) -> Result<String>;
}
