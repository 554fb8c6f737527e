//! JSON-file board persistence.
//!
//! Each board is stored as `<data_dir>/boards/<board-id>.json`. Writes go to
//! a temporary file first and are renamed into place, so a crash mid-save
//! leaves the previous snapshot intact.

use board_core::BoardId;
use board_core::SharedBoard;
use board_core::persistence::{BoardPersistence, PersistenceError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct JsonBoardStore {
    dir: PathBuf,
}

impl JsonBoardStore {
    /// Store boards under `data_dir/boards`, creating it if needed.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("boards");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, board_id: &BoardId) -> PathBuf {
        self.dir.join(format!("{board_id}.json"))
    }

    /// Ids of every board saved here.
    pub fn saved_boards(&self) -> Result<Vec<BoardId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl BoardPersistence for JsonBoardStore {
    fn save(&mut self, board: &SharedBoard) -> Result<()> {
        let path = self.path_for(&board.id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(board)?;
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved board {} (version {}) to {:?}", board.id, board.version, path);
        Ok(())
    }

    fn load(&self, board_id: &BoardId) -> Result<Option<SharedBoard>> {
        let path = self.path_for(board_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let board: SharedBoard = serde_json::from_str(&contents)?;
        if &board.id != board_id {
            return Err(PersistenceError::Other(format!(
                "{:?} holds board {}, expected {}",
                path, board.id, board_id
            )));
        }
        Ok(Some(board))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use board_core::CollaboratorId;
    use tempfile::TempDir;

    fn board() -> SharedBoard {
        SharedBoard::new("Planning", Some("q3".into()), CollaboratorId::from(0xa), 1_000)
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = JsonBoardStore::new(temp_dir.path()).unwrap();
        let board = board();

        store.save(&board).unwrap();
        assert!(temp_dir.path().join("boards").join(format!("{}.json", board.id)).exists());

        let loaded = store.load(&board.id).unwrap().unwrap();
        assert_eq!(loaded, board);
    }

    #[test]
    fn test_missing_board_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonBoardStore::new(temp_dir.path()).unwrap();
        assert!(store.load(&BoardId::new()).unwrap().is_none());
    }

    #[test]
    fn test_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let mut board = board();

        {
            let mut store = JsonBoardStore::new(temp_dir.path()).unwrap();
            store.save(&board).unwrap();
            board.version = 7;
            store.save(&board).unwrap();
        }

        let store = JsonBoardStore::new(temp_dir.path()).unwrap();
        assert_eq!(store.load(&board.id).unwrap().unwrap().version, 7);
        assert_eq!(store.saved_boards().unwrap(), vec![board.id]);
        assert!(!store.path_for(&board.id).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonBoardStore::new(temp_dir.path()).unwrap();
        let id = BoardId::new();
        fs::write(store.path_for(&id), "{not json").unwrap();

        assert!(matches!(
            store.load(&id),
            Err(PersistenceError::Serialization(_))
        ));
    }

    #[test]
    fn test_mismatched_id_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = JsonBoardStore::new(temp_dir.path()).unwrap();
        let board = board();
        store.save(&board).unwrap();

        let other = BoardId::new();
        fs::copy(store.path_for(&board.id), store.path_for(&other)).unwrap();
        assert!(matches!(store.load(&other), Err(PersistenceError::Other(_))));
    }
}
