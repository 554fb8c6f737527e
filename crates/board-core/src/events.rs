//! Event infrastructure for board sessions.
//!
//! Provides `BoardEvent` for UI observers and `EventBus` for subscriptions.
//! Observers hold a [`Subscription`]; dropping it unsubscribes.

use crate::change::{ConflictCategory, ConflictRecord};
use crate::ids::{BoardId, ChangeId, CollaboratorId, TileId};
use crate::model::{Collaborator, CollaboratorStatus, Role, Tile};
use crate::presence::PresenceUpdate;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Everything an observer of a board session can be told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BoardEvent {
    TileAdded { tile: Tile, by: CollaboratorId },
    TileEdited { tile: Tile, by: CollaboratorId },
    TileDeleted { tile_id: TileId, by: CollaboratorId },
    TileLocked { tile_id: TileId, holder: CollaboratorId },
    TileUnlocked {
        tile_id: TileId,
        holder: CollaboratorId,
        /// Released by TTL expiry rather than by the holder
        expired: bool,
    },
    /// A lock we held went to another collaborator (concurrent acquisition)
    LockLost { tile_id: TileId, winner: CollaboratorId },
    SettingsChanged { by: CollaboratorId },
    CollaboratorJoined { collaborator: Collaborator },
    CollaboratorLeft { id: CollaboratorId },
    CollaboratorStatusChanged {
        id: CollaboratorId,
        status: CollaboratorStatus,
    },
    PresenceUpdated {
        id: CollaboratorId,
        presence: PresenceUpdate,
    },
    ConflictRecorded { record: ConflictRecord },
    /// A peer refused one of our changes
    ChangeRejected {
        change_id: ChangeId,
        by: CollaboratorId,
        category: ConflictCategory,
    },
    PeerConnected { peer: CollaboratorId },
    PeerUnreachable { peer: CollaboratorId, retrying: bool },
    SnapshotAdopted { version: u64 },
    JoinRejected { reason: String },
    Invited {
        board_id: BoardId,
        role: Role,
        by: CollaboratorId,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing board events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(BoardEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(BoardEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: BoardEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn peer() -> CollaboratorId {
        CollaboratorId::from(0xb)
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        bus.emit(BoardEvent::PeerConnected { peer: peer() });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![BoardEvent::PeerConnected { peer: peer() }]
        );
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(BoardEvent::SnapshotAdopted { version: 1 });
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(BoardEvent::SnapshotAdopted { version: 2 });
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_partial_unsubscribe() {
        let bus = Arc::new(EventBus::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let count1_clone = Arc::clone(&count1);
        let count2_clone = Arc::clone(&count2);

        let sub1 = bus.subscribe(move |_| {
            count1_clone.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            count2_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(BoardEvent::PeerConnected { peer: peer() });
        drop(sub1);
        bus.emit(BoardEvent::PeerConnected { peer: peer() });

        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_board_event_serialization() {
        let event = BoardEvent::PeerUnreachable {
            peer: peer(),
            retrying: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"peerUnreachable\""));
        assert!(json.contains("\"retrying\":true"));

        let event = BoardEvent::TileDeleted {
            tile_id: TileId::new(),
            by: peer(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"tileId\""));
    }
}
