//! Change synchronizer: history, pending local changes and reconciliation of
//! incoming changes against the board store.
//!
//! Reconciliation of an incoming change `C`:
//! 1. `C.id` already in history: discard.
//! 2. `C` is stale and a pending local change touches the same tile: a delete
//!    beats anything else, otherwise the larger `(target_version, author)`
//!    pair wins on every replica.
//! 3. `C` edits or deletes a tile locked by someone other than its author:
//!    reject.
//! 4. `C` targets a tile this replica deleted: a delete is a duplicate,
//!    anything else is stale.
//! 5. Otherwise apply through the store, raise the board version to
//!    `C.target_version` and remember `C`.

use crate::change::{BoardChange, ChangePayload, ConflictCategory, ConflictRecord, Resolution};
use crate::ids::{ChangeId, CollaboratorId, TileId};
use crate::store::{BoardStore, StoreError};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of recent changes remembered for de-duplication (default: 100)
    pub history_capacity: usize,
    /// Number of conflict records kept (default: 100)
    pub conflict_log_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            conflict_log_capacity: 100,
        }
    }
}

/// A local change not yet acknowledged by every peer it was sent to.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub tile_id: Option<TileId>,
    pub target_version: u64,
    pub author: CollaboratorId,
    pub deletes: bool,
    pub awaiting: HashSet<CollaboratorId>,
}

/// What happened to an incoming change.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Applied to the store. Carries a record when it displaced a pending
    /// local change.
    Applied { conflict: Option<ConflictRecord> },
    /// Already seen.
    Duplicate,
    /// Not applied.
    Rejected { conflict: ConflictRecord },
    /// Not for this board, or not a board mutation.
    Ignored,
}

pub struct ChangeSynchronizer {
    config: SyncConfig,
    history: VecDeque<BoardChange>,
    seen: HashSet<ChangeId>,
    pending: HashMap<ChangeId, PendingChange>,
    conflicts: VecDeque<ConflictRecord>,
}

impl ChangeSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            seen: HashSet::new(),
            pending: HashMap::new(),
            conflicts: VecDeque::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SyncConfig::default())
    }

    // ==================== Local changes ====================

    /// Remember a change made locally and broadcast to `awaiting`.
    pub fn record_local(&mut self, change: &BoardChange, awaiting: HashSet<CollaboratorId>) {
        if !awaiting.is_empty() {
            self.pending.insert(
                change.id,
                PendingChange {
                    tile_id: change.tile_id(),
                    target_version: change.target_version,
                    author: change.author,
                    deletes: change.is_delete(),
                    awaiting,
                },
            );
        }
        self.remember(change.clone());
    }

    /// A peer applied one of our changes. Returns true when the change is no
    /// longer pending.
    pub fn acknowledge(&mut self, change_id: &ChangeId, from: &CollaboratorId) -> bool {
        let Some(entry) = self.pending.get_mut(change_id) else {
            return false;
        };
        entry.awaiting.remove(from);
        if entry.awaiting.is_empty() {
            self.pending.remove(change_id);
            return true;
        }
        false
    }

    /// A peer rejected one of our changes; it is no longer pending anywhere.
    pub fn rejected_by_peer(&mut self, change_id: &ChangeId) -> Option<PendingChange> {
        self.pending.remove(change_id)
    }

    /// Stop waiting on a peer that went away.
    pub fn forget_peer(&mut self, peer: &CollaboratorId) {
        self.pending.retain(|_, entry| {
            entry.awaiting.remove(peer);
            !entry.awaiting.is_empty()
        });
    }

    pub fn is_pending(&self, change_id: &ChangeId) -> bool {
        self.pending.contains_key(change_id)
    }

    /// Local changes `peer` has not acknowledged yet, oldest first.
    pub fn unacked_by(&self, peer: &CollaboratorId) -> Vec<BoardChange> {
        self.history
            .iter()
            .filter(|c| {
                self.pending
                    .get(&c.id)
                    .map(|p| p.awaiting.contains(peer))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn pending_on_tile(&self, tile_id: &TileId) -> Option<(ChangeId, &PendingChange)> {
        self.pending
            .iter()
            .filter(|(_, p)| p.tile_id.as_ref() == Some(tile_id))
            .max_by_key(|(_, p)| (p.target_version, p.author))
            .map(|(id, p)| (*id, p))
    }

    // ==================== Incoming changes ====================

    pub fn reconcile(
        &mut self,
        store: &mut BoardStore,
        change: &BoardChange,
        now_ms: u64,
    ) -> SyncOutcome {
        if change.board_id != store.board().id {
            warn!(
                "Ignoring change {} for board {} (active board is {})",
                change.id,
                change.board_id,
                store.board().id
            );
            return SyncOutcome::Ignored;
        }

        if self.seen.contains(&change.id) {
            debug!("Discarding duplicate change {}", change.id);
            return SyncOutcome::Duplicate;
        }

        let mut displaced = None;
        if change.target_version <= store.version() {
            if let Some(tile_id) = change.tile_id() {
                if let Some((local_id, local)) = self.pending_on_tile(&tile_id) {
                    let incoming = (change.target_version, change.author);
                    let ours = (local.target_version, local.author);
                    let incoming_wins = match (change.is_delete(), local.deletes) {
                        (true, _) => true,
                        (false, true) => false,
                        (false, false) => incoming > ours,
                    };
                    if incoming_wins {
                        displaced = Some(local_id);
                    } else {
                        info!(
                            "Rejecting stale change {} from {} on tile {} (local change {} wins)",
                            change.id, change.author, tile_id, local_id
                        );
                        return self.reject(change, ConflictCategory::StaleVersion, now_ms);
                    }
                }
            }
        }

        match store.apply(&change.author, &change.payload, now_ms) {
            Ok(()) => {}
            Err(StoreError::LockConflict { tile_id, holder }) => {
                info!(
                    "Rejecting change {} from {}: tile {} is locked by {}",
                    change.id, change.author, tile_id, holder
                );
                return self.reject(change, ConflictCategory::LockViolation, now_ms);
            }
            Err(StoreError::TileNotFound(tile_id)) if self.deleted(&tile_id) => {
                if change.is_delete() {
                    debug!("Tile {} already deleted, treating {} as duplicate", tile_id, change.id);
                    store.observe_version(change.target_version);
                    self.remember(change.clone());
                    return SyncOutcome::Duplicate;
                }
                info!(
                    "Rejecting change {} from {}: tile {} was deleted",
                    change.id, change.author, tile_id
                );
                return self.reject(change, ConflictCategory::StaleVersion, now_ms);
            }
            Err(StoreError::TileNotFound(tile_id)) => {
                info!(
                    "Rejecting change {} from {}: unknown tile {}",
                    change.id, change.author, tile_id
                );
                return self.reject(change, ConflictCategory::MissingTile, now_ms);
            }
            Err(StoreError::DuplicateTile(tile_id)) => {
                debug!("Tile {} already present, treating {} as duplicate", tile_id, change.id);
                self.remember(change.clone());
                return SyncOutcome::Duplicate;
            }
            Err(e) => {
                warn!("Ignoring change {} from {}: {}", change.id, change.author, e);
                return SyncOutcome::Ignored;
            }
        }

        store.observe_version(change.target_version);
        self.remember(change.clone());

        let conflict = displaced.map(|local_id| {
            self.pending.remove(&local_id);
            info!(
                "Change {} from {} supersedes local change {}",
                change.id, change.author, local_id
            );
            self.log_conflict(ConflictRecord {
                change_id: change.id,
                category: ConflictCategory::StaleVersion,
                resolution: Resolution::AcceptedRemote,
                author: change.author,
                tile_id: change.tile_id(),
                recorded_at: now_ms,
            })
        });

        SyncOutcome::Applied { conflict }
    }

    /// Whether a delete of `tile_id` has been seen (sent or received).
    fn deleted(&self, tile_id: &TileId) -> bool {
        self.history.iter().any(|c| {
            matches!(&c.payload, ChangePayload::TileDelete(delete) if &delete.tile_id == tile_id)
        })
    }

    fn reject(
        &mut self,
        change: &BoardChange,
        category: ConflictCategory,
        now_ms: u64,
    ) -> SyncOutcome {
        self.remember(change.clone());
        let conflict = self.log_conflict(ConflictRecord {
            change_id: change.id,
            category,
            resolution: Resolution::Rejected,
            author: change.author,
            tile_id: change.tile_id(),
            recorded_at: now_ms,
        });
        SyncOutcome::Rejected { conflict }
    }

    fn log_conflict(&mut self, record: ConflictRecord) -> ConflictRecord {
        if self.conflicts.len() >= self.config.conflict_log_capacity {
            self.conflicts.pop_front();
        }
        self.conflicts.push_back(record.clone());
        record
    }

    fn remember(&mut self, change: BoardChange) {
        if !self.seen.insert(change.id) {
            return;
        }
        if self.history.len() >= self.config.history_capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.seen.remove(&evicted.id);
            }
        }
        self.history.push_back(change);
    }

    // ==================== Snapshots ====================

    /// Treat changes already folded into an adopted snapshot as seen.
    pub fn seed(&mut self, changes: &[BoardChange]) {
        for change in changes {
            self.remember(change.clone());
        }
    }

    /// The most recent changes, oldest first.
    pub fn recent(&self) -> Vec<BoardChange> {
        self.history.iter().cloned().collect()
    }

    pub fn has_seen(&self, change_id: &ChangeId) -> bool {
        self.seen.contains(change_id)
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.iter().cloned().collect()
    }

    /// Forget everything (leaving a session).
    pub fn reset(&mut self) {
        self.history.clear();
        self.seen.clear();
        self.pending.clear();
        self.conflicts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangePayload, TileEdit};
    use crate::model::{Collaborator, Role, TileContent, TilePatch};
    use crate::presence::PresenceUpdate;

    fn alice() -> CollaboratorId {
        CollaboratorId::from(0xa)
    }

    fn bob() -> CollaboratorId {
        CollaboratorId::from(0xb)
    }

    /// Two stores holding the same board with one tile, at version 1.
    fn pair() -> (BoardStore, BoardStore, TileId) {
        let mut a = BoardStore::create(
            "Session Board",
            None,
            Collaborator::new(alice(), "Alice", Role::Owner, 0),
            10,
            0,
        );
        a.join(Collaborator::new(bob(), "Bob", Role::Editor, 0)).unwrap();
        let (tile, _) = a.add_tile(TileContent::text("Hello"), 1).unwrap();
        let b = BoardStore::open(bob(), a.snapshot(), 10);
        (a, b, tile.id)
    }

    fn edit(store: &BoardStore, author: CollaboratorId, tile_id: TileId, text: &str) -> BoardChange {
        BoardChange::new(
            store.board().id,
            author,
            ChangePayload::TileEdit(TileEdit {
                tile_id,
                patch: TilePatch::text(text),
            }),
            10,
            store.version() + 1,
        )
    }

    // ==================== Idempotence ====================

    #[test]
    fn test_duplicate_change_is_discarded() {
        let (_, mut b, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let change = edit(&b, alice(), tile, "Hi");

        assert_eq!(
            sync.reconcile(&mut b, &change, 10),
            SyncOutcome::Applied { conflict: None }
        );
        let after_once = b.snapshot();

        assert_eq!(sync.reconcile(&mut b, &change, 11), SyncOutcome::Duplicate);
        assert_eq!(b.snapshot(), after_once);
    }

    #[test]
    fn test_applied_change_raises_version_to_target() {
        let (_, mut b, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let mut change = edit(&b, alice(), tile, "Hi");
        change.target_version = 7;

        sync.reconcile(&mut b, &change, 10);
        assert_eq!(b.version(), 7);
    }

    #[test]
    fn test_other_board_is_ignored() {
        let (_, mut b, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let mut change = edit(&b, alice(), tile, "Hi");
        change.board_id = Default::default();
        assert_eq!(sync.reconcile(&mut b, &change, 10), SyncOutcome::Ignored);
    }

    #[test]
    fn test_presence_is_not_reconciled() {
        let (_, mut b, _) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let change = BoardChange::new(
            b.board().id,
            alice(),
            ChangePayload::UserCursor(PresenceUpdate::default()),
            10,
            0,
        );
        assert_eq!(sync.reconcile(&mut b, &change, 10), SyncOutcome::Ignored);
        assert!(!sync.has_seen(&change.id));
    }

    // ==================== Rejections ====================

    #[test]
    fn test_edit_of_locked_tile_is_lock_violation() {
        let (_, mut b, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        b.lock_tile(tile, bob()).unwrap();

        let change = edit(&b, alice(), tile, "Hi");
        let SyncOutcome::Rejected { conflict } = sync.reconcile(&mut b, &change, 10) else {
            panic!("expected rejection");
        };
        assert_eq!(conflict.category, ConflictCategory::LockViolation);
        assert_eq!(conflict.resolution, Resolution::Rejected);
        assert_eq!(b.tile(&tile).unwrap().content.text, "Hello");
        // Re-delivery of a rejected change is a duplicate
        assert_eq!(sync.reconcile(&mut b, &change, 11), SyncOutcome::Duplicate);
        assert_eq!(sync.conflicts().len(), 1);
    }

    #[test]
    fn test_edit_of_unknown_tile_is_missing_tile() {
        let (_, mut b, _) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let change = edit(&b, alice(), TileId::new(), "Hi");
        let SyncOutcome::Rejected { conflict } = sync.reconcile(&mut b, &change, 10) else {
            panic!("expected rejection");
        };
        assert_eq!(conflict.category, ConflictCategory::MissingTile);
    }

    // ==================== Stale contention ====================

    #[test]
    fn test_stale_change_without_contention_applies() {
        let (_, mut b, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let mut change = edit(&b, alice(), tile, "Hi");
        change.target_version = 1;

        assert_eq!(
            sync.reconcile(&mut b, &change, 10),
            SyncOutcome::Applied { conflict: None }
        );
        assert_eq!(b.tile(&tile).unwrap().content.text, "Hi");
    }

    #[test]
    fn test_concurrent_same_tile_edits_pick_same_winner() {
        let (mut a, mut b, tile) = pair();
        let mut sync_a = ChangeSynchronizer::with_defaults();
        let mut sync_b = ChangeSynchronizer::with_defaults();

        let (_, change_a) = a.edit_tile(tile, TilePatch::text("from alice"), 10).unwrap();
        sync_a.record_local(&change_a, HashSet::from([bob()]));
        let (_, change_b) = b.edit_tile(tile, TilePatch::text("from bob"), 10).unwrap();
        sync_b.record_local(&change_b, HashSet::from([alice()]));

        // Same target version, bob has the larger id: bob wins everywhere
        let at_a = sync_a.reconcile(&mut a, &change_b, 11);
        let at_b = sync_b.reconcile(&mut b, &change_a, 11);

        let SyncOutcome::Applied { conflict: Some(record) } = at_a else {
            panic!("expected bob's change to win at alice");
        };
        assert_eq!(record.resolution, Resolution::AcceptedRemote);
        assert!(!sync_a.is_pending(&change_a.id));

        let SyncOutcome::Rejected { conflict } = at_b else {
            panic!("expected alice's change to lose at bob");
        };
        assert_eq!(conflict.category, ConflictCategory::StaleVersion);

        assert_eq!(a.tile(&tile).unwrap().content.text, "from bob");
        assert_eq!(b.tile(&tile).unwrap().content.text, "from bob");
    }

    #[test]
    fn test_concurrent_edit_and_delete_converge_on_delete() {
        let (mut a, mut b, tile) = pair();
        let mut sync_a = ChangeSynchronizer::with_defaults();
        let mut sync_b = ChangeSynchronizer::with_defaults();

        let delete = a.delete_tile(tile, 10).unwrap();
        sync_a.record_local(&delete, HashSet::from([bob()]));
        // Bob has the larger id, but a delete beats an edit regardless
        let (_, change_b) = b.edit_tile(tile, TilePatch::text("from bob"), 10).unwrap();
        sync_b.record_local(&change_b, HashSet::from([alice()]));

        let SyncOutcome::Rejected { conflict } = sync_a.reconcile(&mut a, &change_b, 11) else {
            panic!("expected bob's edit to lose at alice");
        };
        assert_eq!(conflict.category, ConflictCategory::StaleVersion);

        let SyncOutcome::Applied { conflict: Some(record) } = sync_b.reconcile(&mut b, &delete, 11)
        else {
            panic!("expected alice's delete to win at bob");
        };
        assert_eq!(record.resolution, Resolution::AcceptedRemote);
        assert!(!sync_b.is_pending(&change_b.id));

        assert!(a.tile(&tile).is_none());
        assert!(b.tile(&tile).is_none());
    }

    #[test]
    fn test_bystander_drops_tile_in_either_order() {
        let (mut a, b, tile) = pair();
        let delete = a.delete_tile(tile, 10).unwrap();
        let edit_b = edit(&b, bob(), tile, "from bob");

        // Delete first, then the concurrent edit
        let mut first = BoardStore::open(CollaboratorId::from(0xc), b.snapshot(), 10);
        let mut sync = ChangeSynchronizer::with_defaults();
        sync.reconcile(&mut first, &delete, 11);
        let SyncOutcome::Rejected { conflict } = sync.reconcile(&mut first, &edit_b, 12) else {
            panic!("expected the edit of a deleted tile to be rejected");
        };
        assert_eq!(conflict.category, ConflictCategory::StaleVersion);

        // Edit first, then the delete
        let mut second = BoardStore::open(CollaboratorId::from(0xc), b.snapshot(), 10);
        let mut sync = ChangeSynchronizer::with_defaults();
        sync.reconcile(&mut second, &edit_b, 11);
        sync.reconcile(&mut second, &delete, 12);

        assert!(first.tile(&tile).is_none());
        assert!(second.tile(&tile).is_none());
    }

    #[test]
    fn test_concurrent_deletes_are_duplicates() {
        let (mut a, mut b, tile) = pair();
        let mut sync_a = ChangeSynchronizer::with_defaults();
        let delete_a = a.delete_tile(tile, 10).unwrap();
        sync_a.record_local(&delete_a, HashSet::from([bob()]));
        let delete_b = b.delete_tile(tile, 10).unwrap();

        assert_eq!(sync_a.reconcile(&mut a, &delete_b, 11), SyncOutcome::Duplicate);
        assert!(sync_a.conflicts().is_empty());
    }

    // ==================== Pending / acks ====================

    #[test]
    fn test_unacked_by_tracks_each_peer() {
        let (mut a, _, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let carol = CollaboratorId::from(0xc);
        let (_, first) = a.edit_tile(tile, TilePatch::text("x"), 10).unwrap();
        sync.record_local(&first, HashSet::from([bob(), carol]));
        let (_, second) = a.edit_tile(tile, TilePatch::text("y"), 11).unwrap();
        sync.record_local(&second, HashSet::from([bob(), carol]));

        sync.acknowledge(&first.id, &bob());
        let ids: Vec<ChangeId> = sync.unacked_by(&bob()).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id]);
        assert_eq!(sync.unacked_by(&carol).len(), 2);
    }

    #[test]
    fn test_pending_cleared_by_all_acks() {
        let (mut a, _, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let carol = CollaboratorId::from(0xc);
        let (_, change) = a.edit_tile(tile, TilePatch::text("x"), 10).unwrap();
        sync.record_local(&change, HashSet::from([bob(), carol]));

        assert!(!sync.acknowledge(&change.id, &bob()));
        assert!(sync.is_pending(&change.id));
        assert!(sync.acknowledge(&change.id, &carol));
        assert_eq!(sync.pending_count(), 0);
    }

    #[test]
    fn test_forget_peer_clears_pending() {
        let (mut a, _, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let (_, change) = a.edit_tile(tile, TilePatch::text("x"), 10).unwrap();
        sync.record_local(&change, HashSet::from([bob()]));
        sync.forget_peer(&bob());
        assert!(!sync.is_pending(&change.id));
    }

    #[test]
    fn test_no_peers_means_not_pending() {
        let (mut a, _, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let (_, change) = a.edit_tile(tile, TilePatch::text("x"), 10).unwrap();
        sync.record_local(&change, HashSet::new());
        assert!(!sync.is_pending(&change.id));
        assert!(sync.has_seen(&change.id));
    }

    // ==================== History ====================

    #[test]
    fn test_history_is_bounded() {
        let (_, mut b, tile) = pair();
        let mut sync = ChangeSynchronizer::new(SyncConfig {
            history_capacity: 2,
            conflict_log_capacity: 2,
        });
        let first = edit(&b, alice(), tile, "1");
        sync.reconcile(&mut b, &first, 1);
        let second = edit(&b, alice(), tile, "2");
        sync.reconcile(&mut b, &second, 2);
        let third = edit(&b, alice(), tile, "3");
        sync.reconcile(&mut b, &third, 3);

        assert_eq!(sync.recent().len(), 2);
        assert!(!sync.has_seen(&first.id));
        assert!(sync.has_seen(&third.id));
    }

    #[test]
    fn test_seeded_changes_are_duplicates() {
        let (_, mut b, tile) = pair();
        let mut sync = ChangeSynchronizer::with_defaults();
        let change = edit(&b, alice(), tile, "Hi");
        sync.seed(std::slice::from_ref(&change));
        assert_eq!(sync.reconcile(&mut b, &change, 10), SyncOutcome::Duplicate);
        assert_eq!(b.tile(&tile).unwrap().content.text, "Hello");
    }
}
