//! Bounded per-peer delivery state.
//!
//! Eviction is by first insertion only: updating a peer never refreshes its slot, so a
//! busy peer inserted early is evicted before a quiet peer inserted later. This is
//! intentionally not an LRU.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::callsign::Callsign;
use crate::chat::ThreadId;

/// Default number of peers tracked at once.
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Delivery state for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    /// Highest inbound sequence number accepted. 0 means nothing seen yet.
    pub last_seen_seq: u32,
    /// Our outbound sequence numbers this peer has acknowledged.
    pub pending_acks: HashSet<u32>,
    /// Sequence number for our next message to this peer.
    pub next_out_seq: u32,
    /// Chat thread carrying the conversation with this peer.
    pub conversation: Option<ThreadId>,
}

impl PeerState {
    pub fn new(first_seq: u32) -> Self {
        Self {
            last_seen_seq: 0,
            pending_acks: HashSet::new(),
            next_out_seq: first_seq,
            conversation: None,
        }
    }
}

/// Fixed-capacity map from callsign to [`PeerState`], evicting in insertion order.
pub struct PeerCache {
    capacity: usize,
    first_seq: u32,
    entries: HashMap<Callsign, PeerState>,
    order: VecDeque<Callsign>,
}

impl PeerCache {
    /// `capacity` is clamped to at least 1. New peers start with `next_out_seq = first_seq`.
    pub fn new(capacity: usize, first_seq: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            first_seq,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, peer: &Callsign) -> Option<&PeerState> {
        self.entries.get(peer)
    }

    pub fn contains(&self, peer: &Callsign) -> bool {
        self.entries.contains_key(peer)
    }

    /// Apply `f` to the peer's state, creating a default state first if absent.
    /// Creating a peer while full evicts the earliest-inserted peer.
    pub fn upsert<R>(&mut self, peer: &Callsign, f: impl FnOnce(&mut PeerState) -> R) -> R {
        if !self.entries.contains_key(peer) {
            if self.entries.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                    tracing::debug!(peer = %oldest, "evicted peer state");
                }
            }
            self.order.push_back(peer.clone());
        }
        let first_seq = self.first_seq;
        let state = self
            .entries
            .entry(peer.clone())
            .or_insert_with(|| PeerState::new(first_seq));
        f(state)
    }

    /// Peer whose conversation is `thread`, if any.
    pub fn find_by_conversation(&self, thread: ThreadId) -> Option<&Callsign> {
        self.entries
            .iter()
            .find(|(_, s)| s.conversation == Some(thread))
            .map(|(peer, _)| peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PeerCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, 1)
    }
}
