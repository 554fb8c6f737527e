//! Presence broadcaster: cursor, selection and typing state.
//!
//! Presence is ephemeral and loss-tolerant. It is never versioned, never kept
//! in change history and never retried. Consumers render the latest value per
//! collaborator.
//!
//! The broadcaster is sans-IO: the session calls [`PresenceBroadcaster::poll`]
//! on every tick and sends whatever update it returns.

use crate::ids::{CollaboratorId, TileId};
use crate::model::CursorPosition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Payload of a `user_cursor` change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub selection: Vec<TileId>,
    #[serde(default)]
    pub typing: bool,
}

/// Latest presence received from a remote collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePresence {
    pub update: PresenceUpdate,
    /// Author-side timestamp of the update
    pub sent_at: u64,
    /// Local time the update arrived
    pub received_at: u64,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum spacing between updates while the local state keeps changing
    pub interval: Duration,
    /// Maximum silence: an update is sent this often even when nothing changed
    pub heartbeat: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            heartbeat: Duration::from_secs(2),
        }
    }
}

pub struct PresenceBroadcaster {
    config: PresenceConfig,
    local: PresenceUpdate,
    dirty: bool,
    running: bool,
    /// When the last update left (None = never)
    last_sent: Option<u64>,
    remote: HashMap<CollaboratorId, RemotePresence>,
}

impl PresenceBroadcaster {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            local: PresenceUpdate::default(),
            dirty: false,
            running: false,
            last_sent: None,
            remote: HashMap::new(),
        }
    }

    pub fn start(&mut self) {
        self.running = true;
        self.dirty = true;
    }

    /// Stop broadcasting and forget everything we know about remote presence.
    pub fn stop(&mut self) {
        self.running = false;
        self.dirty = false;
        self.last_sent = None;
        self.local = PresenceUpdate::default();
        self.remote.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_cursor(&mut self, x: f64, y: f64) {
        let cursor = Some(CursorPosition { x, y });
        if self.local.cursor != cursor {
            self.local.cursor = cursor;
            self.dirty = true;
        }
    }

    pub fn set_selection(&mut self, selection: Vec<TileId>) {
        if self.local.selection != selection {
            self.local.selection = selection;
            self.dirty = true;
        }
    }

    pub fn set_typing(&mut self, typing: bool) {
        if self.local.typing != typing {
            self.local.typing = typing;
            self.dirty = true;
        }
    }

    /// Drop a deleted tile from our selection.
    pub fn deselect(&mut self, tile_id: &TileId) {
        let before = self.local.selection.len();
        self.local.selection.retain(|t| t != tile_id);
        if self.local.selection.len() != before {
            self.dirty = true;
        }
    }

    pub fn local(&self) -> &PresenceUpdate {
        &self.local
    }

    /// Return the update to broadcast now, if any.
    ///
    /// Dirty state goes out once `interval` has passed since the last send;
    /// clean state goes out once `heartbeat` has passed.
    pub fn poll(&mut self, now_ms: u64) -> Option<PresenceUpdate> {
        if !self.running {
            return None;
        }

        let due = match self.last_sent {
            None => true,
            Some(last) => {
                let elapsed = now_ms.saturating_sub(last);
                let interval_ms = self.config.interval.as_millis() as u64;
                let heartbeat_ms = self.config.heartbeat.as_millis() as u64;
                (self.dirty && elapsed >= interval_ms) || elapsed >= heartbeat_ms
            }
        };

        if !due {
            return None;
        }

        self.dirty = false;
        self.last_sent = Some(now_ms);
        Some(self.local.clone())
    }

    /// Record a remote update. Returns false if it is older than what we have.
    pub fn receive(
        &mut self,
        from: CollaboratorId,
        update: PresenceUpdate,
        sent_at: u64,
        now_ms: u64,
    ) -> bool {
        if let Some(existing) = self.remote.get(&from) {
            if existing.sent_at > sent_at {
                return false;
            }
        }
        self.remote.insert(
            from,
            RemotePresence {
                update,
                sent_at,
                received_at: now_ms,
            },
        );
        true
    }

    pub fn latest(&self, id: &CollaboratorId) -> Option<&RemotePresence> {
        self.remote.get(id)
    }

    pub fn forget(&mut self, id: &CollaboratorId) {
        self.remote.remove(id);
    }

    pub fn remote(&self) -> impl Iterator<Item = (&CollaboratorId, &RemotePresence)> {
        self.remote.iter()
    }
}
