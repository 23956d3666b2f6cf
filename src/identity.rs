//! # Peer Identity
//!
//! A peer in the overlay is described by a [`PeerIdentity`]:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `name` | short, human-chosen name (best-effort unique, not enforced) |
//! | `host` / `port` | where the peer's RPC endpoint listens |
//! | `capacity` | maximum number of overlay neighbours the peer accepts |
//!
//! Identities travel by value inside ping/pong/neighbour messages and are
//! never deleted once observed. Equality is structural.
//!
//! ## Decoding
//!
//! Every decoding path validates all fields. A record with an empty name or
//! host, a zero port, or a zero capacity is rejected with an
//! [`IdentityError`] instead of producing a partially-filled identity. This
//! holds for wire decoding (serde goes through [`RawPeerIdentity`]) and for
//! the textual form `name@host:port/capacity` accepted by [`FromStr`].

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upper bound on a peer name, in bytes.
/// SECURITY: Names are echoed in logs and gossip payloads.
pub const MAX_NAME_LENGTH: usize = 64;

/// Upper bound on a host string, in bytes.
pub const MAX_HOST_LENGTH: usize = 255;

/// Reasons a peer identity fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Name is empty.
    EmptyName,
    /// Name is longer than [`MAX_NAME_LENGTH`] or contains whitespace / separators.
    InvalidName(String),
    /// Host is empty or longer than [`MAX_HOST_LENGTH`].
    InvalidHost(String),
    /// Port 0 is not a reachable endpoint.
    ZeroPort,
    /// A peer must accept at least one neighbour.
    ZeroCapacity,
    /// Textual form could not be split into its fields.
    Malformed(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::EmptyName => write!(f, "peer name is empty"),
            IdentityError::InvalidName(name) => write!(f, "invalid peer name {:?}", name),
            IdentityError::InvalidHost(host) => write!(f, "invalid peer host {:?}", host),
            IdentityError::ZeroPort => write!(f, "peer port must be non-zero"),
            IdentityError::ZeroCapacity => write!(f, "peer capacity must be at least 1"),
            IdentityError::Malformed(s) => {
                write!(f, "malformed peer identity {:?} (expected name@host:port/capacity)", s)
            }
        }
    }
}

impl std::error::Error for IdentityError {}

/// Unvalidated wire form of a [`PeerIdentity`].
///
/// Field order matches [`PeerIdentity`] so both serialize identically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawPeerIdentity {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub capacity: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPeerIdentity")]
pub struct PeerIdentity {
    name: String,
    host: String,
    port: u16,
    capacity: u32,
}

impl PeerIdentity {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        capacity: u32,
    ) -> Result<Self, IdentityError> {
        let name = name.into();
        let host = host.into();

        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        if name.len() > MAX_NAME_LENGTH
            || name.chars().any(|c| c.is_whitespace() || c == '@' || c == '/')
        {
            return Err(IdentityError::InvalidName(name));
        }
        if host.is_empty() || host.len() > MAX_HOST_LENGTH || host.chars().any(char::is_whitespace) {
            return Err(IdentityError::InvalidHost(host));
        }
        if port == 0 {
            return Err(IdentityError::ZeroPort);
        }
        if capacity == 0 {
            return Err(IdentityError::ZeroCapacity);
        }

        Ok(Self { name, host, port, capacity })
    }

    /// Build an identity for a bound socket address.
    pub fn from_socket_addr(
        name: impl Into<String>,
        addr: SocketAddr,
        capacity: u32,
    ) -> Result<Self, IdentityError> {
        Self::new(name, addr.ip().to_string(), addr.port(), capacity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The `host:port` string other peers use to reach this one.
    /// IPv6 literals are bracketed so the result parses as a socket address.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// True if `other` names the same peer, either by name or by endpoint.
    pub fn same_peer(&self, other: &PeerIdentity) -> bool {
        self.name == other.name || self.address() == other.address()
    }
}

impl TryFrom<RawPeerIdentity> for PeerIdentity {
    type Error = IdentityError;

    fn try_from(raw: RawPeerIdentity) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.host, raw.port, raw.capacity)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.name, self.address(), self.capacity)
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    /// Parse `name@host:port/capacity`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdentityError::Malformed(s.to_string());

        let (name, rest) = s.split_once('@').ok_or_else(malformed)?;
        let (addr, capacity) = rest.rsplit_once('/').ok_or_else(malformed)?;
        let (host, port) = addr.rsplit_once(':').ok_or_else(malformed)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let port: u16 = port.parse().map_err(|_| malformed())?;
        let capacity: u32 = capacity.parse().map_err(|_| malformed())?;

        Self::new(name, host, port, capacity)
    }
}
