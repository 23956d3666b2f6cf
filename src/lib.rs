//! # Peerdisco - Unstructured P2P Overlay Node
//!
//! Peerdisco runs one node of an unstructured peer-to-peer overlay:
//!
//! - **Discovery**: epidemic gossip (ping/pong) spreads every new peer to all known peers
//! - **Adjacency**: a degree-bounded neighbour graph built by probabilistic, mutual admission
//! - **Search**: flooding and random-walk file-existence queries, bounded by a hop budget
//!   and deduplicated per message id
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for node state:
//! - [`overlay::Overlay`] is a cheap-to-clone handle; a private actor owns the ledgers
//! - Inbound RPC handlers only update state and queue actions
//! - A single dispatcher task performs all outbound calls through the retrying gateway
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: bind, greet, search, fetch |
//! | `identity` | Validated peer identities |
//! | `ledger` | Peer ledger, neighbour set, message ledger, file store |
//! | `admission` | Probabilistic neighbour admission |
//! | `search` | Flood and random-walk rules, search origination |
//! | `overlay` | Inbound RPC surface (handle + actor) |
//! | `dispatcher` | Outbound action execution |
//! | `gateway` | Timeout and retry wrapper for remote calls |
//! | `protocols` | Protocol trait (`OverlayRpc`) |
//! | `rpc` | TCP transport implementing the protocol |
//! | `messages` | Serialization types for the wire protocol |

mod admission;
mod dispatcher;
mod gateway;
mod identity;
mod ledger;
mod messages;
mod node;
mod overlay;
mod protocols;
mod rpc;
mod search;

pub use admission::{DEFAULT_ACCEPT_THRESHOLD, acceptance_score};
pub use dispatcher::{Action, DispatcherConfig};
pub use gateway::{GatewayConfig, RemoteUnavailable, Retries};
pub use identity::{IdentityError, PeerIdentity};
pub use ledger::FileStore;
pub use messages::{FILE_NOT_FOUND, MessageId, SearchStatus};
pub use node::{DEFAULT_CAPACITY, Node, NodeConfig};
pub use overlay::OverlayConfig;
pub use search::{DEFAULT_TTL, DEFAULT_WALKERS, SearchConfig, SearchOutcome, Strategy};
