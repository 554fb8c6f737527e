//! Messages exchanged over a connected peer link.
//!
//! Wire format is JSON tagged by `type`, e.g.
//! `{"type":"ack","changeId":".."}` or `{"type":"change","change":{..}}`.

use super::handshake::MAX_MESSAGE_SIZE;
use crate::change::{BoardChange, ConflictCategory};
use crate::ids::{BoardId, ChangeId, CollaboratorId, TileId};
use crate::model::SharedBoard;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed peer message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PeerMessage {
    /// A board change (or a presence update travelling as one)
    Change { change: BoardChange },
    /// The receiver applied `change_id`
    Ack { change_id: ChangeId },
    /// Lock acquired (`locked`) or released by `holder`. Not versioned.
    Lock {
        tile_id: TileId,
        holder: CollaboratorId,
        locked: bool,
    },
    /// Ask for the full board (sent by a joiner once a link opens)
    SnapshotRequest { board_id: BoardId },
    Snapshot {
        board: SharedBoard,
        /// Changes already folded into `board`, for de-duplication
        recent_changes: Vec<BoardChange>,
    },
    /// The receiver refused `change_id`
    Rejected {
        change_id: ChangeId,
        category: ConflictCategory,
    },
    /// Keeps a quiet link alive when presence is not being shared
    Heartbeat,
}

impl PeerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Change { .. } => "change",
            PeerMessage::Ack { .. } => "ack",
            PeerMessage::Lock { .. } => "lock",
            PeerMessage::SnapshotRequest { .. } => "snapshotRequest",
            PeerMessage::Snapshot { .. } => "snapshot",
            PeerMessage::Rejected { .. } => "rejected",
            PeerMessage::Heartbeat => "heartbeat",
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("PeerMessage serialization should not fail")
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        Ok(serde_json::from_slice(data)?)
    }
}
