//! # Node-Local Ledgers
//!
//! The state a node keeps about the overlay, each structure owned by exactly
//! one node instance:
//!
//! | Structure | Key | Grows | Shrinks |
//! |-----------|-----|-------|---------|
//! | [`PeerLedger`] | peer name | on ping / pong / neighbour request | never |
//! | [`NeighbourSet`] | peer name | on mutual admission, up to capacity | never |
//! | [`MessageLedger`] | search id | on first sighting of a search | LRU eviction only |
//! | [`FileStore`] | file name | at startup / `share` | never |
//!
//! None of these structures knows about the network; the overlay actor is
//! the only writer and serializes every mutation.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::identity::PeerIdentity;
use crate::messages::{MessageId, SearchStatus};

/// Default bound on tracked searches.
/// SECURITY: Unique message ids are free to mint; the ledger must not grow without bound.
pub const DEFAULT_MAX_TRACKED_SEARCHES: usize = 10_000;

// ============================================================================
// Peer Ledger
// ============================================================================

/// Peers known to this node, ordered by name.
///
/// The node's own identity is never stored: anything with our name or our
/// endpoint address is refused.
#[derive(Debug)]
pub struct PeerLedger {
    local: PeerIdentity,
    peers: BTreeMap<String, PeerIdentity>,
}

impl PeerLedger {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
        }
    }

    pub fn is_local(&self, peer: &PeerIdentity) -> bool {
        self.local.same_peer(peer)
    }

    /// Record `peer`, refreshing its last-known address and capacity.
    /// Returns true only when the peer was not known before.
    pub fn observe(&mut self, peer: &PeerIdentity) -> bool {
        if self.is_local(peer) {
            return false;
        }
        match self.peers.get_mut(peer.name()) {
            Some(existing) => {
                if existing != peer {
                    *existing = peer.clone();
                }
                false
            }
            None => {
                self.peers.insert(peer.name().to_string(), peer.clone());
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn list(&self) -> Vec<PeerIdentity> {
        self.peers.values().cloned().collect()
    }

    /// Gossip fan-out targets for announcing `subject`: every known peer but `subject` itself.
    pub fn others(&self, subject: &PeerIdentity) -> Vec<PeerIdentity> {
        self.peers
            .values()
            .filter(|p| !p.same_peer(subject))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Neighbour Set
// ============================================================================

/// Overlay neighbours, bounded by the local capacity, in admission order.
#[derive(Debug)]
pub struct NeighbourSet {
    capacity: usize,
    members: Vec<PeerIdentity>,
}

impl NeighbourSet {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity as usize,
            members: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub fn has_spare_capacity(&self) -> bool {
        !self.is_full()
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.members.iter().any(|m| m.same_peer(peer))
    }

    /// Add `peer` if there is room and it is not already a neighbour.
    /// Returns true if the set changed.
    pub fn add(&mut self, peer: PeerIdentity) -> bool {
        if self.is_full() || self.contains(&peer) {
            return false;
        }
        self.members.push(peer);
        true
    }

    pub fn list(&self) -> Vec<PeerIdentity> {
        self.members.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.members.iter()
    }
}

// ============================================================================
// Message Ledger
// ============================================================================

/// What this node knows about one search.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchRecord {
    /// The query itself has reached this node (as opposed to only a `found` report).
    pub seen: bool,
    /// Address of the first reported holder, or our own address when we hold the file.
    pub holder: Option<String>,
    /// Network arrivals of this search at this node.
    pub hits: u64,
}

impl SearchRecord {
    pub fn is_found(&self) -> bool {
        self.holder.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First time the query reached this node; it may be answered and forwarded.
    First,
    /// The query was already processed here; only the hit count changed.
    Repeat,
}

/// Per-search deduplication and accounting.
///
/// Uses LruCache so that a flood of distinct message ids evicts the oldest
/// searches instead of growing the ledger.
pub struct MessageLedger {
    records: LruCache<MessageId, SearchRecord>,
}

impl MessageLedger {
    pub fn new(max_tracked: usize) -> Self {
        let cap = NonZeroUsize::new(max_tracked.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(cap),
        }
    }

    /// Register one arrival of `msg_id`.
    ///
    /// `from_network` is false only when the originator submits its own
    /// search locally; such a submission is not a network message and does
    /// not count as a hit. Every later arrival counts.
    pub fn observe(&mut self, msg_id: MessageId, from_network: bool) -> Sighting {
        let record = self.records.get_or_insert_mut(msg_id, SearchRecord::default);
        if record.seen {
            record.hits += 1;
            return Sighting::Repeat;
        }
        record.seen = true;
        if from_network {
            record.hits += 1;
        }
        Sighting::First
    }

    /// Record `holder` for `msg_id` unless a holder is already known.
    /// Returns true if this call set the holder.
    pub fn record_found(&mut self, msg_id: MessageId, holder: &str) -> bool {
        let record = self.records.get_or_insert_mut(msg_id, SearchRecord::default);
        if record.holder.is_some() {
            return false;
        }
        record.holder = Some(holder.to_string());
        true
    }

    pub fn record(&self, msg_id: MessageId) -> Option<&SearchRecord> {
        self.records.peek(&msg_id)
    }

    /// Status of `msg_id`; unknown ids report "not found, zero hits".
    pub fn status(&self, msg_id: MessageId) -> SearchStatus {
        match self.record(msg_id) {
            Some(record) => SearchStatus {
                found: record.is_found(),
                holder: record.holder.clone().unwrap_or_default(),
                hits: record.hits,
            },
            None => SearchStatus::default(),
        }
    }

    pub fn hits(&self, msg_id: MessageId) -> u64 {
        self.record(msg_id).map(|r| r.hits).unwrap_or(0)
    }
}

// ============================================================================
// File Store
// ============================================================================

/// Files this node answers for. Read-only from the network's point of view.
#[derive(Debug, Default)]
pub struct FileStore {
    files: HashMap<String, String>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.files.insert(name.into(), content.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, port: u16) -> PeerIdentity {
        PeerIdentity::new(name, "127.0.0.1", port, 2).unwrap()
    }

    #[test]
    fn peer_ledger_never_stores_self() {
        let local = peer("A", 4000);
        let mut ledger = PeerLedger::new(local.clone());

        assert!(!ledger.observe(&local));
        assert!(!ledger.observe(&peer("A", 4999)));
        assert!(!ledger.observe(&peer("impostor", 4000)));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn peer_ledger_observe_is_idempotent_and_refreshes() {
        let mut ledger = PeerLedger::new(peer("A", 4000));

        assert!(ledger.observe(&peer("B", 4001)));
        assert!(!ledger.observe(&peer("B", 4001)));
        assert_eq!(ledger.len(), 1);

        let moved = peer("B", 4101);
        assert!(!ledger.observe(&moved));
        assert_eq!(ledger.list(), vec![moved]);
    }

    #[test]
    fn peer_ledger_lists_in_name_order_and_excludes_subject() {
        let mut ledger = PeerLedger::new(peer("A", 4000));
        for (name, port) in [("D", 4003), ("B", 4001), ("C", 4002)] {
            ledger.observe(&peer(name, port));
        }

        let names: Vec<String> = ledger.list().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["B", "C", "D"]);

        let others: Vec<String> = ledger
            .others(&peer("C", 4002))
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(others, vec!["B", "D"]);
    }

    #[test]
    fn neighbour_set_respects_capacity() {
        let mut set = NeighbourSet::new(2);
        assert!(set.add(peer("B", 4001)));
        assert!(!set.add(peer("B", 4001)));
        assert!(set.add(peer("C", 4002)));
        assert!(set.is_full());
        assert!(!set.add(peer("D", 4003)));
        let names: Vec<&str> = set.iter().map(PeerIdentity::name).collect();
        assert_eq!(names, vec!["B", "C"]);
    }

    #[test]
    fn first_local_sighting_has_no_hits() {
        let mut ledger = MessageLedger::new(16);
        assert_eq!(ledger.observe(9, false), Sighting::First);
        assert_eq!(ledger.hits(9), 0);

        assert_eq!(ledger.observe(9, true), Sighting::Repeat);
        assert_eq!(ledger.hits(9), 1);
    }

    #[test]
    fn network_sightings_count_every_arrival() {
        let mut ledger = MessageLedger::new(16);
        assert_eq!(ledger.observe(1, true), Sighting::First);
        assert_eq!(ledger.observe(1, true), Sighting::Repeat);
        assert_eq!(ledger.observe(1, true), Sighting::Repeat);
        assert_eq!(ledger.hits(1), 3);
    }

    #[test]
    fn first_holder_wins() {
        let mut ledger = MessageLedger::new(16);
        ledger.observe(5, false);

        assert!(ledger.record_found(5, "10.0.0.1:4000"));
        assert!(!ledger.record_found(5, "10.0.0.2:4000"));

        let status = ledger.status(5);
        assert!(status.found);
        assert_eq!(status.holder, "10.0.0.1:4000");
    }

    #[test]
    fn found_before_query_does_not_mark_seen() {
        let mut ledger = MessageLedger::new(16);
        ledger.record_found(3, "10.0.0.1:4000");

        assert!(!ledger.record(3).unwrap().seen);
        assert_eq!(ledger.observe(3, true), Sighting::First);
        assert_eq!(ledger.status(3).holder, "10.0.0.1:4000");
    }

    #[test]
    fn unknown_message_reports_zero() {
        let ledger = MessageLedger::new(16);
        assert_eq!(ledger.status(77), SearchStatus::default());
        assert_eq!(ledger.hits(77), 0);
    }

    #[test]
    fn message_ledger_is_bounded() {
        let mut ledger = MessageLedger::new(4);
        for id in 0..10 {
            ledger.observe(id, true);
        }
        let tracked = (0..10).filter(|id| ledger.record(*id).is_some()).count();
        assert_eq!(tracked, 4);
        assert!(ledger.record(0).is_none());
        assert!(ledger.record(9).is_some());
    }

    #[test]
    fn file_store_lookup() {
        let mut store = FileStore::new();
        store.insert("bacon", "crispy");
        assert!(store.contains("bacon"));
        assert_eq!(store.get("bacon"), Some("crispy"));
        assert_eq!(store.get("eggs"), None);
        assert_eq!(store.len(), 1);
    }
}
