//! Shared board store: the per-replica authoritative copy of a board.
//!
//! Local operations and remote change application go through the same
//! [`BoardStore::apply`] path, so the lock and versioning rules hold the same
//! way regardless of where a change came from.
//!
//! Every mutation validates before it touches anything: a failed operation
//! leaves the board exactly as it was.

use crate::change::{BoardChange, ChangePayload, TileDelete, TileEdit};
use crate::ids::{CollaboratorId, TileId};
use crate::model::{
    BoardSettingsPatch, Collaborator, CollaboratorStatus, CursorPosition, LockState, Permission,
    SharedBoard, Tile, TileContent, TilePatch,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Tile {tile_id} is locked by {holder}")]
    LockConflict {
        tile_id: TileId,
        holder: CollaboratorId,
    },
    #[error("Collaborator {collaborator} lacks permission {permission:?}")]
    PermissionDenied {
        collaborator: CollaboratorId,
        permission: Permission,
    },
    #[error("Board is full ({max} collaborators)")]
    CapacityExceeded { max: usize },
    #[error("Tile not found: {0}")]
    TileNotFound(TileId),
    #[error("Tile already exists: {0}")]
    DuplicateTile(TileId),
    #[error("Presence updates are not board mutations")]
    NotABoardMutation,
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct BoardStore {
    local: CollaboratorId,
    board: SharedBoard,
    max_collaborators: usize,
}

impl BoardStore {
    /// Create a new board owned by `owner`, at version 0.
    pub fn create(
        name: impl Into<String>,
        description: Option<String>,
        owner: Collaborator,
        max_collaborators: usize,
        now_ms: u64,
    ) -> Self {
        let mut board = SharedBoard::new(name, description, owner.id, now_ms);
        let local = owner.id;
        board.collaborators.push(owner);
        Self {
            local,
            board,
            max_collaborators,
        }
    }

    /// Open an existing board copy (loaded or placeholder) for `local`.
    pub fn open(local: CollaboratorId, board: SharedBoard, max_collaborators: usize) -> Self {
        Self {
            local,
            board,
            max_collaborators,
        }
    }

    pub fn local_id(&self) -> CollaboratorId {
        self.local
    }

    pub fn board(&self) -> &SharedBoard {
        &self.board
    }

    pub fn version(&self) -> u64 {
        self.board.version
    }

    pub fn tile(&self, id: &TileId) -> Option<&Tile> {
        self.board.tile(id)
    }

    /// A full copy of the board.
    pub fn snapshot(&self) -> SharedBoard {
        self.board.clone()
    }

    /// Check that the local collaborator holds `permission`.
    pub fn check(&self, permission: Permission) -> Result<()> {
        let allowed = self
            .board
            .collaborator(&self.local)
            .map(|c| c.can(permission))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied {
                collaborator: self.local,
                permission,
            })
        }
    }

    // ==================== Local mutations ====================

    pub fn add_tile(&mut self, content: TileContent, now_ms: u64) -> Result<(Tile, BoardChange)> {
        self.check(Permission::AddTile)?;
        let tile = Tile {
            id: TileId::new(),
            content,
            version: 1,
            lock: LockState::Unlocked,
            last_editor: Some(self.local),
            updated_at: now_ms,
        };
        let change = self.commit_local(ChangePayload::TileAdd(tile.clone()), now_ms)?;
        Ok((tile, change))
    }

    pub fn edit_tile(
        &mut self,
        tile_id: TileId,
        patch: TilePatch,
        now_ms: u64,
    ) -> Result<(Tile, BoardChange)> {
        self.check(Permission::EditTile)?;
        let change =
            self.commit_local(ChangePayload::TileEdit(TileEdit { tile_id, patch }), now_ms)?;
        let tile = self
            .board
            .tile(&tile_id)
            .cloned()
            .ok_or(StoreError::TileNotFound(tile_id))?;
        Ok((tile, change))
    }

    pub fn delete_tile(&mut self, tile_id: TileId, now_ms: u64) -> Result<BoardChange> {
        self.check(Permission::DeleteTile)?;
        self.commit_local(ChangePayload::TileDelete(TileDelete { tile_id }), now_ms)
    }

    pub fn update_settings(&mut self, patch: BoardSettingsPatch, now_ms: u64) -> Result<BoardChange> {
        self.check(Permission::EditSettings)?;
        self.commit_local(ChangePayload::BoardSettings(patch), now_ms)
    }

    fn commit_local(&mut self, payload: ChangePayload, now_ms: u64) -> Result<BoardChange> {
        let local = self.local;
        self.apply(&local, &payload, now_ms)?;
        Ok(BoardChange::new(
            self.board.id,
            local,
            payload,
            now_ms,
            self.board.version,
        ))
    }

    // ==================== Uniform application path ====================

    /// Apply a mutation on behalf of `author`. Bumps the board version by one
    /// on success; changes nothing on failure.
    pub fn apply(
        &mut self,
        author: &CollaboratorId,
        payload: &ChangePayload,
        now_ms: u64,
    ) -> Result<()> {
        match payload {
            ChangePayload::TileAdd(tile) => {
                if self.board.tile(&tile.id).is_some() {
                    return Err(StoreError::DuplicateTile(tile.id));
                }
                let mut tile = tile.clone();
                // Locks travel separately; a fresh tile is always unlocked
                tile.lock = LockState::Unlocked;
                self.board.tiles.push(tile);
            }
            ChangePayload::TileEdit(edit) => {
                let tile = self
                    .board
                    .tile_mut(&edit.tile_id)
                    .ok_or(StoreError::TileNotFound(edit.tile_id))?;
                if let LockState::LockedBy { holder } = tile.lock {
                    if &holder != author {
                        return Err(StoreError::LockConflict {
                            tile_id: edit.tile_id,
                            holder,
                        });
                    }
                }
                edit.patch.apply_to(&mut tile.content);
                tile.version += 1;
                tile.last_editor = Some(*author);
                tile.updated_at = now_ms;
            }
            ChangePayload::TileDelete(delete) => {
                let index = self
                    .board
                    .tiles
                    .iter()
                    .position(|t| t.id == delete.tile_id)
                    .ok_or(StoreError::TileNotFound(delete.tile_id))?;
                if let LockState::LockedBy { holder } = self.board.tiles[index].lock {
                    if &holder != author {
                        return Err(StoreError::LockConflict {
                            tile_id: delete.tile_id,
                            holder,
                        });
                    }
                }
                self.board.tiles.remove(index);
            }
            ChangePayload::BoardSettings(patch) => {
                self.board.apply_settings(patch);
            }
            ChangePayload::UserCursor(_) => return Err(StoreError::NotABoardMutation),
        }

        self.board.version += 1;
        self.board.updated_at = now_ms;
        debug!(
            "Applied {:?} from {} (board version {})",
            payload.kind(),
            author,
            self.board.version
        );
        Ok(())
    }

    /// Raise the board version to at least `version`.
    pub fn observe_version(&mut self, version: u64) {
        self.board.version = self.board.version.max(version);
    }

    // ==================== Locks ====================

    /// Acquire a lock for `holder`. Returns false if the tile is already
    /// locked, including by `holder`.
    pub fn lock_tile(&mut self, tile_id: TileId, holder: CollaboratorId) -> Result<bool> {
        let tile = self
            .board
            .tile_mut(&tile_id)
            .ok_or(StoreError::TileNotFound(tile_id))?;
        match tile.lock {
            LockState::Unlocked => {
                tile.lock = LockState::LockedBy { holder };
                Ok(true)
            }
            LockState::LockedBy { .. } => Ok(false),
        }
    }

    /// Release a lock. Only the current holder can release.
    pub fn unlock_tile(&mut self, tile_id: TileId, holder: CollaboratorId) -> Result<bool> {
        let tile = self
            .board
            .tile_mut(&tile_id)
            .ok_or(StoreError::TileNotFound(tile_id))?;
        match tile.lock {
            LockState::LockedBy { holder: current } if current == holder => {
                tile.lock = LockState::Unlocked;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Hand a lock to `holder` regardless of its current state.
    /// Returns the previous holder.
    pub fn force_lock(&mut self, tile_id: TileId, holder: CollaboratorId) -> Result<Option<CollaboratorId>> {
        let tile = self
            .board
            .tile_mut(&tile_id)
            .ok_or(StoreError::TileNotFound(tile_id))?;
        let previous = tile.lock.holder();
        tile.lock = LockState::LockedBy { holder };
        Ok(previous)
    }

    /// Clear a lock regardless of holder. Returns the previous holder.
    pub fn force_unlock(&mut self, tile_id: TileId) -> Option<CollaboratorId> {
        let tile = self.board.tile_mut(&tile_id)?;
        let previous = tile.lock.holder();
        tile.lock = LockState::Unlocked;
        previous
    }

    pub fn locks_held_by(&self, holder: &CollaboratorId) -> Vec<TileId> {
        self.board
            .tiles
            .iter()
            .filter(|t| t.lock.holder().as_ref() == Some(holder))
            .map(|t| t.id)
            .collect()
    }

    // ==================== Collaborators ====================

    /// Register a collaborator as present.
    ///
    /// An existing entry keeps its role and permissions (an invite decides
    /// those); a new one is admitted only if the board has room.
    pub fn join(&mut self, collaborator: Collaborator) -> Result<()> {
        let others_present = self
            .board
            .collaborators
            .iter()
            .filter(|c| c.id != collaborator.id && c.is_present())
            .count();

        if let Some(existing) = self.board.collaborator_mut(&collaborator.id) {
            if !existing.is_present() && others_present >= self.max_collaborators {
                return Err(StoreError::CapacityExceeded {
                    max: self.max_collaborators,
                });
            }
            existing.display_name = collaborator.display_name;
            existing.status = CollaboratorStatus::Online;
            existing.last_active = existing.last_active.max(collaborator.last_active);
            return Ok(());
        }

        if others_present >= self.max_collaborators {
            return Err(StoreError::CapacityExceeded {
                max: self.max_collaborators,
            });
        }
        self.board.collaborators.push(collaborator);
        Ok(())
    }

    /// Remove a collaborator that left explicitly.
    pub fn leave(&mut self, id: &CollaboratorId) -> Option<Collaborator> {
        let index = self.board.collaborators.iter().position(|c| &c.id == id)?;
        Some(self.board.collaborators.remove(index))
    }

    /// Add or update an entry for an invited collaborator.
    pub fn invite(&mut self, invited: Collaborator) {
        match self.board.collaborator_mut(&invited.id) {
            Some(existing) => {
                existing.role = invited.role;
                existing.permissions = invited.permissions;
            }
            None => self.board.collaborators.push(invited),
        }
    }

    /// Set a collaborator's status. Returns true if it changed.
    pub fn set_status(&mut self, id: &CollaboratorId, status: CollaboratorStatus) -> bool {
        match self.board.collaborator_mut(id) {
            Some(c) if c.status != status => {
                c.status = status;
                if status == CollaboratorStatus::Offline {
                    c.cursor = None;
                }
                true
            }
            _ => false,
        }
    }

    /// Record activity. Returns true if this brought the collaborator back online.
    pub fn touch(&mut self, id: &CollaboratorId, now_ms: u64) -> bool {
        match self.board.collaborator_mut(id) {
            Some(c) => {
                c.last_active = c.last_active.max(now_ms);
                if c.status != CollaboratorStatus::Online {
                    c.status = CollaboratorStatus::Online;
                    return true;
                }
                false
            }
            None => false,
        }
    }

    pub fn set_cursor(&mut self, id: &CollaboratorId, cursor: Option<CursorPosition>) {
        if let Some(c) = self.board.collaborator_mut(id) {
            c.cursor = cursor;
        }
    }

    /// Online collaborators idle since before `cutoff_ms`, excluding ourselves.
    pub fn idle_since(&self, cutoff_ms: u64) -> Vec<CollaboratorId> {
        self.board
            .collaborators
            .iter()
            .filter(|c| {
                c.id != self.local
                    && c.status == CollaboratorStatus::Online
                    && c.last_active < cutoff_ms
            })
            .map(|c| c.id)
            .collect()
    }

    /// Everyone but us goes offline (used when reopening a persisted copy).
    pub fn mark_others_offline(&mut self) {
        let local = self.local;
        for c in self.board.collaborators.iter_mut().filter(|c| c.id != local) {
            c.status = CollaboratorStatus::Offline;
            c.cursor = None;
        }
    }

    // ==================== Snapshots ====================

    /// Replace our copy with a snapshot received from a peer. Our own
    /// collaborator entry survives if the snapshot does not have it yet.
    pub fn adopt(&mut self, snapshot: SharedBoard) {
        let ours = self.board.collaborator(&self.local).cloned();
        self.board = snapshot;
        if let Some(ours) = ours {
            match self.board.collaborator_mut(&ours.id) {
                Some(entry) => entry.status = CollaboratorStatus::Online,
                None => self.board.collaborators.push(ours),
            }
        }
    }
}
