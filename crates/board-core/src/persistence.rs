//! BoardPersistence trait for saving board snapshots.
//!
//! The session saves on create/join and then on a fixed cadence while a board
//! is active. Implementations:
//! - `MemoryPersistence`: in-memory, for tests
//! - `JsonBoardStore` (board-peer): one JSON file per board

use crate::ids::BoardId;
use crate::model::SharedBoard;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

pub trait BoardPersistence {
    fn save(&mut self, board: &SharedBoard) -> Result<()>;

    /// Load a previously saved board. `Ok(None)` if there is none.
    fn load(&self, board_id: &BoardId) -> Result<Option<SharedBoard>>;
}

/// In-memory persistence. Clones share the same storage, so a test can keep
/// a handle and inspect what a session saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    boards: Arc<Mutex<HashMap<BoardId, SharedBoard>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, board_id: &BoardId) -> Option<SharedBoard> {
        self.boards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(board_id)
            .cloned()
    }
}

impl BoardPersistence for MemoryPersistence {
    fn save(&mut self, board: &SharedBoard) -> Result<()> {
        self.boards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(board.id, board.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn load(&self, board_id: &BoardId) -> Result<Option<SharedBoard>> {
        Ok(self.get(board_id))
    }
}
