//! board-core: sans-IO core of a peer-to-peer collaborative whiteboard.
//!
//! This crate provides:
//! - The shared board model and its versioned store
//! - Change reconciliation, tile locking and presence
//! - Peer connection management over a pluggable `PeerTransport`
//! - The signaling and peer-link wire formats
//! - `CollabSession`, which wires it all together behind a clock
//!
//! Nothing here performs IO. Hosts feed the session signaling messages,
//! transport events and timer ticks, and carry its outgoing signals.

pub mod change;
pub mod clock;
pub mod config;
pub mod events;
pub mod ids;
pub mod lock;
pub mod model;
pub mod peer;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod store;
pub mod sync;
pub mod transport;

pub use change::{BoardChange, ChangeKind, ChangePayload, ConflictCategory, ConflictRecord, Resolution};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SessionConfig};
pub use events::{BoardEvent, EventBus, Subscription};
pub use ids::{BoardId, ChangeId, CollaboratorId, SessionId, TileId};
pub use model::{
    Collaborator, CollaboratorStatus, Permission, Role, SessionSettings, SharedBoard, Tile,
    TileContent, TilePatch,
};
pub use peer::{ConnectionError, PeerConnectionManager, PeerOutput};
pub use persistence::{BoardPersistence, MemoryPersistence, PersistenceError};
pub use presence::PresenceUpdate;
pub use session::{CollabSession, SessionError};
pub use signaling::{SignalMessage, SignalPayload};
pub use store::{BoardStore, StoreError};
pub use transport::{MemoryNetwork, MemoryTransport, PeerTransport, TransportEvent};
