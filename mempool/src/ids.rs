//! Compact numeric handles for connected peers.
//!
//! Pool entries remember which peers already have them as a set of `u16`
//! rather than full peer identities. ID 0 is never handed out: it marks a
//! transaction submitted locally.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use halyard_network::PeerId;

use crate::MempoolError;

/// Sender ID of transactions that did not come from a peer.
pub const UNKNOWN_PEER_ID: u16 = 0;

/// Most peers that can hold an ID at once.
pub const MAX_ACTIVE_IDS: usize = u16::MAX as usize;

pub struct MempoolIds {
    max_active: usize,
    inner: RwLock<IdsInner>,
}

struct IdsInner {
    peer_map: HashMap<PeerId, u16>,
    active: HashSet<u16>,
    /// Where the next search starts.
    next_id: u16,
}

impl MempoolIds {
    pub fn new() -> Self {
        Self::with_max_active(MAX_ACTIVE_IDS)
    }

    /// A registry that refuses peers beyond `max_active` (capped at
    /// [`MAX_ACTIVE_IDS`]).
    pub fn with_max_active(max_active: usize) -> Self {
        Self {
            max_active: max_active.min(MAX_ACTIVE_IDS),
            inner: RwLock::new(IdsInner {
                peer_map: HashMap::new(),
                active: HashSet::new(),
                next_id: 1,
            }),
        }
    }

    /// Assign the next free ID to `peer`. A peer that already holds an ID
    /// gets the same one back.
    pub fn reserve_for_peer(&self, peer: &PeerId) -> Result<u16, MempoolError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&id) = inner.peer_map.get(peer) {
            return Ok(id);
        }
        if inner.active.len() >= self.max_active {
            return Err(MempoolError::IdSpaceExhausted(inner.active.len()));
        }

        let mut id = inner.next_id;
        while id == UNKNOWN_PEER_ID || inner.active.contains(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);
        inner.active.insert(id);
        inner.peer_map.insert(peer.clone(), id);
        Ok(id)
    }

    /// Release the ID held by `peer`, if any.
    pub fn reclaim(&self, peer: &PeerId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = inner.peer_map.remove(peer) {
            inner.active.remove(&id);
        }
    }

    /// The ID held by `peer`, or [`UNKNOWN_PEER_ID`].
    pub fn get_for_peer(&self, peer: &PeerId) -> u16 {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.peer_map.get(peer).copied().unwrap_or(UNKNOWN_PEER_ID)
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).active.len()
    }
}

impl Default for MempoolIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: usize) -> PeerId {
        PeerId::new(format!("peer-{n}"))
    }

    #[test]
    fn ids_start_at_one() {
        let ids = MempoolIds::new();
        assert_eq!(ids.reserve_for_peer(&peer(0)).unwrap(), 1);
        assert_eq!(ids.reserve_for_peer(&peer(1)).unwrap(), 2);
        assert_eq!(ids.get_for_peer(&peer(1)), 2);
    }

    #[test]
    fn unknown_peer_maps_to_zero() {
        let ids = MempoolIds::new();
        assert_eq!(ids.get_for_peer(&peer(9)), UNKNOWN_PEER_ID);
    }

    #[test]
    fn reserving_twice_returns_the_same_id() {
        let ids = MempoolIds::new();
        let id = ids.reserve_for_peer(&peer(0)).unwrap();
        assert_eq!(ids.reserve_for_peer(&peer(0)).unwrap(), id);
        assert_eq!(ids.active_count(), 1);
    }

    #[test]
    fn search_continues_from_the_watermark() {
        let ids = MempoolIds::with_max_active(3);
        for n in 0..3 {
            ids.reserve_for_peer(&peer(n)).unwrap();
        }
        ids.reclaim(&peer(1));
        assert_eq!(ids.get_for_peer(&peer(1)), UNKNOWN_PEER_ID);

        // Freed ID 2 is not reused until the watermark wraps around.
        assert_eq!(ids.reserve_for_peer(&peer(7)).unwrap(), 4);
    }

    #[test]
    fn live_ids_are_never_shared() {
        let ids = MempoolIds::with_max_active(10);
        let mut seen = HashSet::new();
        for round in 0..50 {
            let p = peer(round);
            let id = ids.reserve_for_peer(&p).unwrap();
            assert!(seen.insert(id), "id {id} handed out twice");
            if round % 2 == 0 {
                ids.reclaim(&p);
                seen.remove(&id);
            }
            if ids.active_count() == 10 {
                break;
            }
        }
    }

    #[test]
    fn exhaustion_refuses_new_peers() {
        let ids = MempoolIds::with_max_active(2);
        ids.reserve_for_peer(&peer(0)).unwrap();
        ids.reserve_for_peer(&peer(1)).unwrap();
        assert_eq!(
            ids.reserve_for_peer(&peer(2)),
            Err(MempoolError::IdSpaceExhausted(2))
        );
        // Existing holders still resolve.
        assert_eq!(ids.reserve_for_peer(&peer(0)).unwrap(), 1);

        ids.reclaim(&peer(0));
        assert!(ids.reserve_for_peer(&peer(2)).is_ok());
    }

    #[test]
    fn full_id_space_wraps_past_zero() {
        let ids = MempoolIds::new();
        for n in 0..MAX_ACTIVE_IDS {
            ids.reserve_for_peer(&peer(n)).unwrap();
        }
        assert!(matches!(
            ids.reserve_for_peer(&peer(MAX_ACTIVE_IDS)),
            Err(MempoolError::IdSpaceExhausted(_))
        ));

        ids.reclaim(&peer(0));
        assert_eq!(ids.reserve_for_peer(&peer(MAX_ACTIVE_IDS)).unwrap(), 1);
    }
}
