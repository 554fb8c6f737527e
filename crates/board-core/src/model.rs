//! Data model for shared boards: sessions, collaborators, boards and tiles.
//!
//! Everything here is plain serializable data. Mutation rules (permissions,
//! locks, versioning) live in [`crate::store`].

use crate::ids::{BoardId, CollaboratorId, SessionId, TileId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    SharedBoard,
}

/// Per-session toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Carried for external screen-share collaborators; the core does not act on it.
    pub screen_share: bool,
    /// Broadcast our cursor/selection to peers.
    pub cursor_share: bool,
    /// Exchange board changes with peers. When off the replica is local-only.
    pub board_sync: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            screen_share: false,
            cursor_share: true,
            board_sync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    pub board_id: BoardId,
    pub created_at: u64,
    pub active: bool,
    pub settings: SessionSettings,
}

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    AddTile,
    EditTile,
    DeleteTile,
    LockTile,
    EditSettings,
    Invite,
}

impl Role {
    /// Default permission set granted by a role.
    pub fn permissions(self) -> BTreeSet<Permission> {
        use Permission::*;
        match self {
            Role::Owner => [AddTile, EditTile, DeleteTile, LockTile, EditSettings, Invite]
                .into_iter()
                .collect(),
            Role::Editor => [AddTile, EditTile, DeleteTile, LockTile].into_iter().collect(),
            Role::Viewer => BTreeSet::new(),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: CollaboratorId,
    pub display_name: String,
    pub role: Role,
    pub permissions: BTreeSet<Permission>,
    pub status: CollaboratorStatus,
    /// Last observed activity (ms since epoch)
    pub last_active: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

impl Collaborator {
    pub fn new(id: CollaboratorId, display_name: impl Into<String>, role: Role, now_ms: u64) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role,
            permissions: role.permissions(),
            status: CollaboratorStatus::Online,
            last_active: now_ms,
            cursor: None,
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Online or away: still holds a slot on the board.
    pub fn is_present(&self) -> bool {
        self.status != CollaboratorStatus::Offline
    }
}

// ============================================================================
// Tiles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 120.0,
            height: 120.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Symbol,
}

/// Reference to externally stored media; the core never loads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub kind: MediaKind,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub border_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
}

/// Content fields of a tile. Also what `add_tile` takes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileContent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub position: Point,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub style: TileStyle,
}

impl TileContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Point { x, y };
        self
    }
}

/// Partial update of tile content. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<MediaRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<TileStyle>,
}

impl TilePatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position: Some(Point { x, y }),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub(crate) fn apply_to(&self, content: &mut TileContent) {
        if let Some(text) = &self.text {
            content.text = text.clone();
        }
        if let Some(media) = &self.media {
            content.media = media.clone();
        }
        if let Some(position) = self.position {
            content.position = position;
        }
        if let Some(size) = self.size {
            content.size = size;
        }
        if let Some(style) = &self.style {
            content.style = style.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    #[default]
    Unlocked,
    LockedBy { holder: CollaboratorId },
}

impl LockState {
    pub fn holder(&self) -> Option<CollaboratorId> {
        match self {
            LockState::Unlocked => None,
            LockState::LockedBy { holder } => Some(*holder),
        }
    }

    /// True when locked by someone other than `who`.
    pub fn blocks(&self, who: &CollaboratorId) -> bool {
        matches!(self, LockState::LockedBy { holder } if holder != who)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub id: TileId,
    pub content: TileContent,
    /// Per-tile version, starts at 1 and increments on every accepted edit
    pub version: u64,
    #[serde(default)]
    pub lock: LockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_editor: Option<CollaboratorId>,
    pub updated_at: u64,
}

// ============================================================================
// Board
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    pub grid_size: u32,
    pub snap_to_grid: bool,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            background_color: None,
            grid_size: 20,
            snap_to_grid: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_to_grid: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedBoard {
    pub id: BoardId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner: CollaboratorId,
    pub tiles: Vec<Tile>,
    /// Board version: +1 per accepted mutation, never decreases
    pub version: u64,
    #[serde(default)]
    pub settings: BoardSettings,
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SharedBoard {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        owner: CollaboratorId,
        now_ms: u64,
    ) -> Self {
        Self {
            id: BoardId::new(),
            name: name.into(),
            description,
            owner,
            tiles: Vec::new(),
            version: 0,
            settings: BoardSettings::default(),
            collaborators: Vec::new(),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Empty stand-in for a board we joined but have no copy of yet.
    /// Replaced by the first snapshot received from a peer.
    pub fn placeholder(id: BoardId, owner: CollaboratorId, now_ms: u64) -> Self {
        Self {
            id,
            name: String::new(),
            description: None,
            owner,
            tiles: Vec::new(),
            version: 0,
            settings: BoardSettings::default(),
            collaborators: Vec::new(),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn tile(&self, id: &TileId) -> Option<&Tile> {
        self.tiles.iter().find(|t| &t.id == id)
    }

    pub(crate) fn tile_mut(&mut self, id: &TileId) -> Option<&mut Tile> {
        self.tiles.iter_mut().find(|t| &t.id == id)
    }

    pub fn collaborator(&self, id: &CollaboratorId) -> Option<&Collaborator> {
        self.collaborators.iter().find(|c| &c.id == id)
    }

    pub(crate) fn collaborator_mut(&mut self, id: &CollaboratorId) -> Option<&mut Collaborator> {
        self.collaborators.iter_mut().find(|c| &c.id == id)
    }

    pub(crate) fn apply_settings(&mut self, patch: &BoardSettingsPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(color) = &patch.background_color {
            self.settings.background_color = Some(color.clone());
        }
        if let Some(grid) = patch.grid_size {
            self.settings.grid_size = grid;
        }
        if let Some(snap) = patch.snap_to_grid {
            self.settings.snap_to_grid = snap;
        }
    }
}
