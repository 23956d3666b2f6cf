//! # Wire Protocol Messages
//!
//! This module defines the serializable request/response types exchanged
//! between overlay nodes. Messages are serialized with bincode; decoding is
//! always size-bounded.
//!
//! ## Requests
//!
//! | Request | Purpose | Response |
//! |---------|---------|----------|
//! | `Hello` | bootstrap towards a known address | `Ack` |
//! | `Ping` / `Pong` | gossip peer discovery | `Ack` |
//! | `Who` | identity of the callee | `Identity` |
//! | `PeerList` / `NeighbourList` | known peers / overlay neighbours | `Peers` |
//! | `NeighbourRequest` | ask to become neighbours | `Neighbour` |
//! | `Find` | flood search hop | `Ack` |
//! | `StartWalk` / `WalkerFind` | random-walk search | `Ack` |
//! | `Found` | report the holder of a file to the originator | `Ack` |
//! | `HasFoundFile` | search status on the originator | `SearchStatus` |
//! | `SearchMessages` | hit count for one search | `Count` |
//! | `Get` | fetch file content | `File` |
//!
//! ## Message IDs
//!
//! Each search carries an opaque 64-bit [`MessageId`] picked at random by
//! the originator. Collisions are tolerated: two searches sharing an id are
//! simply deduplicated together.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::PeerIdentity;

/// Identifier of one search, chosen by its originator.
pub type MessageId = u64;

/// Content returned by `get` when the file is not in the store.
pub const FILE_NOT_FOUND: &str = "File not found";

/// Maximum size of a serialized request (64 KiB).
/// SECURITY: Requests only carry identities, names and visited lists.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Maximum size of a serialized response (1 MiB); file contents dominate.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_RESPONSE_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_RESPONSE_SIZE as u64) + 4096;

/// Maximum random walkers one search may start.
/// SECURITY: Each walker becomes one queued action on the starting node.
pub const MAX_WALKERS: u32 = 64;

/// Maximum entries accepted in a walker's visited list.
/// SECURITY: Bounds the per-hop growth of random-walk messages.
pub const MAX_VISITED: usize = 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn serialize_request(request: &RpcRequest) -> Result<Vec<u8>, bincode::Error> {
    serialize(request)
}

pub fn deserialize_request(data: &[u8]) -> Result<RpcRequest, bincode::Error> {
    deserialize_bounded(data)
}

/// A file-existence query as it travels hop by hop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Address of the originator; `found` reports go here.
    pub requester: String,
    pub msg_id: MessageId,
    pub file_name: String,
    /// Remaining hop budget. A query with `ttl == 0` is expired.
    pub ttl: u32,
}

impl Query {
    pub fn new(requester: impl Into<String>, msg_id: MessageId, file_name: impl Into<String>, ttl: u32) -> Self {
        Self {
            requester: requester.into(),
            msg_id,
            file_name: file_name.into(),
            ttl,
        }
    }

    /// The same query one hop further along.
    pub fn next_hop(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }

    pub fn is_expired(&self) -> bool {
        self.ttl == 0
    }
}

/// Search progress as seen by one node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStatus {
    pub found: bool,
    /// Address of the first reported holder; empty while not found.
    pub holder: String,
    pub hits: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Hello {
        addr: String,
    },
    Ping {
        who: PeerIdentity,
    },
    Pong {
        who: PeerIdentity,
    },
    Who,
    PeerList,
    NeighbourList,
    NeighbourRequest {
        candidate: PeerIdentity,
    },
    Find(Query),
    StartWalk {
        query: Query,
        walkers: u32,
    },
    WalkerFind {
        query: Query,
        visited: Vec<String>,
    },
    Found {
        msg_id: MessageId,
        holder: String,
    },
    HasFoundFile {
        msg_id: MessageId,
    },
    SearchMessages {
        msg_id: MessageId,
    },
    Get {
        file_name: String,
    },
}

impl RpcRequest {
    /// Method name used in logs and gateway errors.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Hello { .. } => "hello",
            RpcRequest::Ping { .. } => "ping",
            RpcRequest::Pong { .. } => "pong",
            RpcRequest::Who => "who",
            RpcRequest::PeerList => "plist",
            RpcRequest::NeighbourList => "nlist",
            RpcRequest::NeighbourRequest { .. } => "neighbourRequest",
            RpcRequest::Find(_) => "find",
            RpcRequest::StartWalk { .. } => "startWalk",
            RpcRequest::WalkerFind { .. } => "walkerFind",
            RpcRequest::Found { .. } => "found",
            RpcRequest::HasFoundFile { .. } => "hasFoundFile",
            RpcRequest::SearchMessages { .. } => "getNumSearchMessages",
            RpcRequest::Get { .. } => "get",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Ack(bool),
    Identity(PeerIdentity),
    Peers(Vec<PeerIdentity>),
    Neighbour {
        accepted: bool,
        peer: PeerIdentity,
    },
    SearchStatus(SearchStatus),
    Count(u64),
    File(String),
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> PeerIdentity {
        PeerIdentity::new("P1", "127.0.0.1", 4000, 2).unwrap()
    }

    #[test]
    fn next_hop_decrements_ttl_and_keeps_the_rest() {
        let query = Query::new("127.0.0.1:4000", 7, "bacon", 3);
        let next = query.next_hop();
        assert_eq!(next.ttl, 2);
        assert_eq!(next.msg_id, 7);
        assert_eq!(next.file_name, "bacon");
        assert_eq!(next.requester, "127.0.0.1:4000");

        let expired = Query::new("a:1", 1, "f", 0);
        assert!(expired.is_expired());
        assert_eq!(expired.next_hop().ttl, 0);
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_request(&garbage).is_err());

        let request = RpcRequest::Ping { who: test_peer() };
        let bytes = serialize_request(&request).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_request(truncated).is_err());
    }

    #[test]
    fn invalid_identity_in_request_is_rejected() {
        use crate::identity::RawPeerIdentity;

        #[derive(Serialize)]
        enum ForgedRequest {
            #[allow(dead_code)]
            Hello { addr: String },
            Ping { who: RawPeerIdentity },
        }

        let forged = ForgedRequest::Ping {
            who: RawPeerIdentity {
                name: String::new(),
                host: "127.0.0.1".into(),
                port: 4000,
                capacity: 2,
            },
        };
        let bytes = serialize(&forged).unwrap();
        assert!(deserialize_request(&bytes).is_err());
    }

    #[test]
    fn walker_request_keeps_visited_order() {
        let request = RpcRequest::WalkerFind {
            query: Query::new("127.0.0.1:4000", 42, "bacon", 5),
            visited: vec!["a:1".into(), "b:2".into(), "c:3".into()],
        };
        let bytes = serialize_request(&request).unwrap();

        match deserialize_request(&bytes).unwrap() {
            RpcRequest::WalkerFind { query, visited } => {
                assert_eq!(query.ttl, 5);
                assert_eq!(visited, vec!["a:1", "b:2", "c:3"]);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn method_names_match_rpc_surface() {
        assert_eq!(RpcRequest::Who.method(), "who");
        assert_eq!(RpcRequest::PeerList.method(), "plist");
        assert_eq!(
            RpcRequest::SearchMessages { msg_id: 1 }.method(),
            "getNumSearchMessages"
        );
        assert_eq!(
            RpcRequest::NeighbourRequest { candidate: test_peer() }.method(),
            "neighbourRequest"
        );
    }

    #[test]
    fn neighbour_response_carries_identity() {
        let response = RpcResponse::Neighbour {
            accepted: true,
            peer: test_peer(),
        };
        let bytes = serialize(&response).unwrap();
        let decoded: RpcResponse = deserialize_bounded(&bytes).unwrap();

        match decoded {
            RpcResponse::Neighbour { accepted, peer } => {
                assert!(accepted);
                assert_eq!(peer, test_peer());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
