//! # Object Registry
//!
//! Per-server table of values that have left the process by reference. Each
//! entry carries the hosted object, its precomputed capability bitmap and a
//! per-peer breakdown of reference contributions, so that a disconnecting
//! peer releases exactly its own share.
//!
//! Object ids are non-zero, monotonic and never reused within a server's
//! lifetime; id 0 is reserved for the server's builtin surface and never
//! appears here. `own` is idempotent by object identity: sending the same
//! object twice yields the same id.
//!
//! Contributions are signed. A release notice can overtake the incref that a
//! forwarding peer sent on the new holder's behalf; the holder's count dips
//! negative and the entry stays alive until the incref lands and every
//! contribution is settled at zero.

use crate::objects::{Caps, RemoteObject};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Attribution key for reference contributions: the peer name announced in
/// the connection handshake.
pub type PeerName = String;

/// One hosted object and its bookkeeping.
pub struct ObjectEntry {
    pub id: u64,
    pub value: Arc<dyn RemoteObject>,
    pub type_name: String,
    pub caps: Caps,
    refs: HashMap<PeerName, i64>,
}

impl ObjectEntry {
    /// Summed reference count across all peers.
    pub fn total(&self) -> i64 {
        self.refs.values().sum()
    }

    /// Contribution of a single peer.
    pub fn contribution(&self, peer: &str) -> i64 {
        self.refs.get(peer).copied().unwrap_or(0)
    }

    /// An entry is done when every contribution has settled to zero. A
    /// negative contribution marks an in-flight incref and keeps the entry
    /// alive even at a zero sum.
    fn settled(&self) -> bool {
        self.refs.values().all(|&n| n == 0)
    }

    fn prune_settled_peers(&mut self) {
        self.refs.retain(|_, n| *n != 0);
    }
}

/// Table mapping object ids to owned values.
#[derive(Default)]
pub struct ObjectRegistry {
    next_id: u64,
    entries: HashMap<u64, ObjectEntry>,
    // Arc pointer identity of live entries, for idempotent `own`
    by_identity: HashMap<usize, u64>,
}

fn identity_of(value: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value, or find its existing id.
    ///
    /// Registration alone contributes no references; callers pair it with an
    /// [`ObjectRegistry::incref`] attributed to whoever will hold the
    /// descriptor.
    pub fn own(&mut self, value: &Arc<dyn RemoteObject>) -> u64 {
        let identity = identity_of(value);
        if let Some(&id) = self.by_identity.get(&identity) {
            return id;
        }

        self.next_id += 1;
        let id = self.next_id;
        let entry = ObjectEntry {
            id,
            value: Arc::clone(value),
            type_name: value.type_name().to_string(),
            caps: value.caps(),
            refs: HashMap::new(),
        };
        debug!(id, type_name = %entry.type_name, "registered object");
        self.entries.insert(id, entry);
        self.by_identity.insert(identity, id);
        id
    }

    /// Look up a hosted object.
    pub fn get(&self, id: u64) -> Option<Arc<dyn RemoteObject>> {
        self.entries.get(&id).map(|entry| Arc::clone(&entry.value))
    }

    /// Descriptor metadata of an entry.
    pub fn meta(&self, id: u64) -> Option<(String, Caps)> {
        self.entries
            .get(&id)
            .map(|entry| (entry.type_name.clone(), entry.caps))
    }

    /// Add `n` references attributed to `peer`.
    pub fn incref(&mut self, id: u64, n: i64, peer: &str) {
        self.adjust(id, n, peer, "incref");
    }

    /// Drop `n` references attributed to `peer`; the entry is retired when
    /// every contribution settles at zero.
    pub fn decref(&mut self, id: u64, n: i64, peer: &str) {
        self.adjust(id, -n, peer, "decref");
    }

    fn adjust(&mut self, id: u64, delta: i64, peer: &str, what: &'static str) {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                *entry.refs.entry(peer.to_string()).or_insert(0) += delta;
                entry.prune_settled_peers();
                let total = entry.total();
                debug!(id, peer, delta, total, "{what}");
                if entry.settled() {
                    self.retire(id);
                }
            }
            None => warn!(id, peer, delta, "{what} on unknown object"),
        }
    }

    /// Atomically drop every contribution made by `peer`, retiring entries
    /// it alone was keeping alive. Returns how many entries were retired.
    pub fn release_all_from(&mut self, peer: &str) -> usize {
        let affected: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.refs.contains_key(peer))
            .map(|(&id, _)| id)
            .collect();

        let mut retired = 0;
        for id in affected {
            let entry = self.entries.get_mut(&id).expect("entry disappeared");
            entry.refs.remove(peer);
            if entry.settled() {
                self.retire(id);
                retired += 1;
            }
        }
        if retired > 0 {
            debug!(peer, retired, "released contributions of disconnected peer");
        }
        retired
    }

    /// Current summed refcount, or `None` for unknown ids.
    pub fn refcount(&self, id: u64) -> Option<i64> {
        self.entries.get(&id).map(ObjectEntry::total)
    }

    /// Contribution of one peer to one entry.
    pub fn contribution(&self, id: u64, peer: &str) -> i64 {
        self.entries
            .get(&id)
            .map(|entry| entry.contribution(peer))
            .unwrap_or(0)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry; used when the server closes.
    pub fn drain(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.by_identity.clear();
        count
    }

    fn retire(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            let identity = identity_of(&entry.value);
            self.by_identity.remove(&identity);
            debug!(id, type_name = %entry.type_name, "retired object");
        }
    }
}
