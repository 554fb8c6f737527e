//! Tile lock leases.
//!
//! The board store records who holds a lock; the coordinator records until
//! when. Every replica tracks every lease, so a lock whose holder went silent
//! is released everywhere once its TTL runs out, with no extra messages.
//!
//! Activity by the holder on the locked tile renews the lease.

use crate::ids::{CollaboratorId, TileId};
use crate::model::SharedBoard;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a lease lives without renewal (default: 30s)
    pub ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub holder: CollaboratorId,
    pub acquired_at: u64,
    pub expires_at: u64,
}

/// Winner of two concurrent acquisitions of the same tile.
///
/// Every replica sees both claims eventually, so ordering on the id alone
/// gives the same answer everywhere.
pub fn contention_winner(a: CollaboratorId, b: CollaboratorId) -> CollaboratorId {
    a.min(b)
}

pub struct LockCoordinator {
    config: LockConfig,
    leases: HashMap<TileId, Lease>,
}

impl LockCoordinator {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            leases: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LockConfig::default())
    }

    fn ttl_ms(&self) -> u64 {
        self.config.ttl.as_millis() as u64
    }

    /// Start (or renew) a lease for `holder`.
    pub fn granted(&mut self, tile_id: TileId, holder: CollaboratorId, now_ms: u64) {
        let expires_at = now_ms + self.ttl_ms();
        self.leases
            .entry(tile_id)
            .and_modify(|lease| {
                if lease.holder != holder {
                    lease.holder = holder;
                    lease.acquired_at = now_ms;
                }
                lease.expires_at = expires_at;
            })
            .or_insert(Lease {
                holder,
                acquired_at: now_ms,
                expires_at,
            });
    }

    /// Renew the lease if `who` holds it. Returns true if renewed.
    pub fn touch(&mut self, tile_id: &TileId, who: &CollaboratorId, now_ms: u64) -> bool {
        let ttl = self.ttl_ms();
        match self.leases.get_mut(tile_id) {
            Some(lease) if &lease.holder == who => {
                lease.expires_at = now_ms + ttl;
                true
            }
            _ => false,
        }
    }

    pub fn released(&mut self, tile_id: &TileId) -> Option<Lease> {
        self.leases.remove(tile_id)
    }

    pub fn lease(&self, tile_id: &TileId) -> Option<&Lease> {
        self.leases.get(tile_id)
    }

    pub fn holder(&self, tile_id: &TileId) -> Option<CollaboratorId> {
        self.leases.get(tile_id).map(|l| l.holder)
    }

    /// Remove and return every lease that has run out.
    pub fn expired(&mut self, now_ms: u64) -> Vec<(TileId, CollaboratorId)> {
        let mut expired: Vec<(TileId, CollaboratorId)> = self
            .leases
            .iter()
            .filter(|(_, lease)| now_ms >= lease.expires_at)
            .map(|(tile_id, lease)| (*tile_id, lease.holder))
            .collect();
        for (tile_id, _) in &expired {
            self.leases.remove(tile_id);
        }
        expired.sort_by_key(|(tile_id, _)| *tile_id);
        expired
    }

    /// Drop every lease held by `holder`. Returns the affected tiles.
    pub fn release_holder(&mut self, holder: &CollaboratorId) -> Vec<TileId> {
        let tiles: Vec<TileId> = self
            .leases
            .iter()
            .filter(|(_, lease)| &lease.holder == holder)
            .map(|(tile_id, _)| *tile_id)
            .collect();
        for tile_id in &tiles {
            self.leases.remove(tile_id);
        }
        tiles
    }

    /// Rebuild leases from the locks recorded in a board (after adopting a
    /// snapshot or reopening a saved copy). Every lease starts fresh.
    pub fn seed(&mut self, board: &SharedBoard, now_ms: u64) {
        self.leases.clear();
        for tile in &board.tiles {
            if let Some(holder) = tile.lock.holder() {
                self.granted(tile.id, holder, now_ms);
            }
        }
    }

    pub fn clear(&mut self) {
        self.leases.clear();
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LockState, Tile, TileContent};

    fn alice() -> CollaboratorId {
        CollaboratorId::from(0xa)
    }

    fn bob() -> CollaboratorId {
        CollaboratorId::from(0xb)
    }

    fn coordinator() -> LockCoordinator {
        LockCoordinator::new(LockConfig {
            ttl: Duration::from_millis(1000),
        })
    }

    #[test]
    fn test_lease_expires_after_ttl() {
        let mut locks = coordinator();
        let tile = TileId::new();
        locks.granted(tile, alice(), 0);

        assert!(locks.expired(999).is_empty());
        assert_eq!(locks.expired(1000), vec![(tile, alice())]);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_touch_by_holder_renews() {
        let mut locks = coordinator();
        let tile = TileId::new();
        locks.granted(tile, alice(), 0);

        assert!(locks.touch(&tile, &alice(), 800));
        assert!(!locks.touch(&tile, &bob(), 900));
        assert!(locks.expired(1500).is_empty());
        assert_eq!(locks.expired(1800).len(), 1);
    }

    #[test]
    fn test_regrant_to_new_holder_resets_acquired_at() {
        let mut locks = coordinator();
        let tile = TileId::new();
        locks.granted(tile, alice(), 0);
        locks.granted(tile, bob(), 500);
        let lease = locks.lease(&tile).unwrap();
        assert_eq!(lease.holder, bob());
        assert_eq!(lease.acquired_at, 500);
        assert_eq!(lease.expires_at, 1500);
    }

    #[test]
    fn test_release_holder_drops_only_theirs() {
        let mut locks = coordinator();
        let a = TileId::new();
        let b = TileId::new();
        locks.granted(a, alice(), 0);
        locks.granted(b, bob(), 0);

        assert_eq!(locks.release_holder(&alice()), vec![a]);
        assert_eq!(locks.holder(&b), Some(bob()));
        assert_eq!(locks.holder(&a), None);
    }

    #[test]
    fn test_contention_lower_id_wins() {
        assert_eq!(contention_winner(bob(), alice()), alice());
        assert_eq!(contention_winner(alice(), bob()), alice());
    }

    #[test]
    fn test_seed_from_board() {
        let mut board = SharedBoard::new("b", None, alice(), 0);
        let locked = TileId::new();
        board.tiles.push(Tile {
            id: locked,
            content: TileContent::text("x"),
            version: 1,
            lock: LockState::LockedBy { holder: bob() },
            last_editor: None,
            updated_at: 0,
        });
        board.tiles.push(Tile {
            id: TileId::new(),
            content: TileContent::text("y"),
            version: 1,
            lock: LockState::Unlocked,
            last_editor: None,
            updated_at: 0,
        });

        let mut locks = coordinator();
        locks.seed(&board, 100);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks.lease(&locked).unwrap().expires_at, 1100);
    }
}
