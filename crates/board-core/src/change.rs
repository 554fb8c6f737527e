//! Board change records and conflict records.
//!
//! A `BoardChange` is both the wire message exchanged between replicas and the
//! entry kept in the synchronizer's history ring.
//!
//! Wire format:
//! `{"id":..,"boardId":..,"userId":..,"type":"tile_edit","data":{..},"timestamp":..,"version":..}`
//!
//! The `data` field is validated against `type` on the way in: a `tile_edit`
//! whose data does not parse as an edit is rejected at decode time instead of
//! travelling further as an untyped object.

use crate::ids::{BoardId, ChangeId, CollaboratorId, TileId};
use crate::model::{BoardSettingsPatch, Tile, TilePatch};
use crate::presence::PresenceUpdate;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Discriminant of a change, as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    TileAdd,
    TileEdit,
    TileDelete,
    BoardSettings,
    UserCursor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileEdit {
    pub tile_id: TileId,
    pub patch: TilePatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDelete {
    pub tile_id: TileId,
}

/// Typed payload of a change, one shape per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangePayload {
    TileAdd(Tile),
    TileEdit(TileEdit),
    TileDelete(TileDelete),
    BoardSettings(BoardSettingsPatch),
    /// Ephemeral presence. Never versioned, never kept in history.
    UserCursor(PresenceUpdate),
}

impl ChangePayload {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangePayload::TileAdd(_) => ChangeKind::TileAdd,
            ChangePayload::TileEdit(_) => ChangeKind::TileEdit,
            ChangePayload::TileDelete(_) => ChangeKind::TileDelete,
            ChangePayload::BoardSettings(_) => ChangeKind::BoardSettings,
            ChangePayload::UserCursor(_) => ChangeKind::UserCursor,
        }
    }

    /// The tile this payload targets, if any.
    pub fn tile_id(&self) -> Option<TileId> {
        match self {
            ChangePayload::TileAdd(tile) => Some(tile.id),
            ChangePayload::TileEdit(edit) => Some(edit.tile_id),
            ChangePayload::TileDelete(delete) => Some(delete.tile_id),
            ChangePayload::BoardSettings(_) | ChangePayload::UserCursor(_) => None,
        }
    }
}

/// An immutable, uniquely identified description of one mutation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireChange")]
pub struct BoardChange {
    pub id: ChangeId,
    pub board_id: BoardId,
    pub author: CollaboratorId,
    pub payload: ChangePayload,
    /// When the change was made on the author's replica (ms since epoch)
    pub timestamp: u64,
    /// Board version on the author's replica after applying this change
    pub target_version: u64,
}

impl BoardChange {
    pub fn new(
        board_id: BoardId,
        author: CollaboratorId,
        payload: ChangePayload,
        timestamp: u64,
        target_version: u64,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            board_id,
            author,
            payload,
            timestamp,
            target_version,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.payload.kind()
    }

    pub fn tile_id(&self) -> Option<TileId> {
        self.payload.tile_id()
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.payload, ChangePayload::TileDelete(_))
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("BoardChange serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl Serialize for BoardChange {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut st = s.serialize_struct("BoardChange", 7)?;
        st.serialize_field("id", &self.id)?;
        st.serialize_field("boardId", &self.board_id)?;
        st.serialize_field("userId", &self.author)?;
        st.serialize_field("type", &self.kind())?;
        match &self.payload {
            ChangePayload::TileAdd(tile) => st.serialize_field("data", tile)?,
            ChangePayload::TileEdit(edit) => st.serialize_field("data", edit)?,
            ChangePayload::TileDelete(delete) => st.serialize_field("data", delete)?,
            ChangePayload::BoardSettings(patch) => st.serialize_field("data", patch)?,
            ChangePayload::UserCursor(update) => st.serialize_field("data", update)?,
        }
        st.serialize_field("timestamp", &self.timestamp)?;
        st.serialize_field("version", &self.target_version)?;
        st.end()
    }
}

/// Untyped wire shape, validated into a `BoardChange`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChange {
    id: ChangeId,
    board_id: BoardId,
    user_id: CollaboratorId,
    #[serde(rename = "type")]
    kind: ChangeKind,
    data: serde_json::Value,
    timestamp: u64,
    version: u64,
}

impl TryFrom<WireChange> for BoardChange {
    type Error = String;

    fn try_from(wire: WireChange) -> Result<Self, Self::Error> {
        fn shape<T: serde::de::DeserializeOwned>(
            kind: ChangeKind,
            data: serde_json::Value,
        ) -> Result<T, String> {
            serde_json::from_value(data).map_err(|e| format!("invalid {kind:?} data: {e}"))
        }

        let payload = match wire.kind {
            ChangeKind::TileAdd => ChangePayload::TileAdd(shape(wire.kind, wire.data)?),
            ChangeKind::TileEdit => ChangePayload::TileEdit(shape(wire.kind, wire.data)?),
            ChangeKind::TileDelete => ChangePayload::TileDelete(shape(wire.kind, wire.data)?),
            ChangeKind::BoardSettings => {
                ChangePayload::BoardSettings(shape(wire.kind, wire.data)?)
            }
            ChangeKind::UserCursor => ChangePayload::UserCursor(shape(wire.kind, wire.data)?),
        };

        Ok(BoardChange {
            id: wire.id,
            board_id: wire.board_id,
            author: wire.user_id,
            payload,
            timestamp: wire.timestamp,
            target_version: wire.version,
        })
    }
}

// ============================================================================
// Conflicts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCategory {
    /// The change was built against an older board state and lost to a
    /// concurrent change on the same tile (or the tile was deleted).
    StaleVersion,
    /// The change targets a tile locked by someone other than its author.
    LockViolation,
    /// The change targets a tile this replica does not have.
    MissingTile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    AcceptedRemote,
    Rejected,
}

/// Produced whenever an incoming change cannot be applied verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub change_id: ChangeId,
    pub category: ConflictCategory,
    pub resolution: Resolution,
    pub author: CollaboratorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_id: Option<TileId>,
    pub recorded_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LockState, TileContent};

    fn author() -> CollaboratorId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    fn edit_change() -> BoardChange {
        BoardChange::new(
            BoardId::new(),
            author(),
            ChangePayload::TileEdit(TileEdit {
                tile_id: TileId::new(),
                patch: TilePatch::text("Hi"),
            }),
            1000,
            2,
        )
    }

    #[test]
    fn test_wire_field_names() {
        let change = edit_change();
        let json: serde_json::Value = serde_json::from_slice(&change.to_json()).unwrap();
        assert_eq!(json["type"], "tile_edit");
        assert_eq!(json["userId"], "a1b2c3d4e5f67890");
        assert_eq!(json["version"], 2);
        assert_eq!(json["data"]["patch"]["text"], "Hi");
        assert!(json.get("boardId").is_some());
    }

    #[test]
    fn test_decode_validates_data_shape() {
        let change = edit_change();
        let mut json: serde_json::Value = serde_json::from_slice(&change.to_json()).unwrap();
        json["type"] = "tile_delete".into();
        json["data"] = serde_json::json!({ "text": "not a delete" });
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(BoardChange::from_json(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let change = edit_change();
        let mut json: serde_json::Value = serde_json::from_slice(&change.to_json()).unwrap();
        json["type"] = "tile_explode".into();
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(BoardChange::from_json(&bytes).is_err());
    }

    #[test]
    fn test_tile_add_carries_full_tile() {
        let tile = Tile {
            id: TileId::new(),
            content: TileContent::text("Hello"),
            version: 1,
            lock: LockState::Unlocked,
            last_editor: Some(author()),
            updated_at: 5,
        };
        let change = BoardChange::new(
            BoardId::new(),
            author(),
            ChangePayload::TileAdd(tile.clone()),
            5,
            1,
        );
        let decoded = BoardChange::from_json(&change.to_json()).unwrap();
        assert_eq!(decoded, change);
        assert_eq!(decoded.tile_id(), Some(tile.id));
    }

    #[test]
    fn test_settings_payload_has_no_tile() {
        let payload = ChangePayload::BoardSettings(BoardSettingsPatch::default());
        assert_eq!(payload.kind(), ChangeKind::BoardSettings);
        assert_eq!(payload.tile_id(), None);
    }
}
