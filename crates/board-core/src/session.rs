//! Collaboration session: the facade a UI or host drives.
//!
//! A `CollabSession` owns one replica's view of at most one shared board and
//! wires together the board store, change synchronizer, lock coordinator,
//! presence broadcaster and peer connection manager. Nothing is global: the
//! host constructs a session with its transport, persistence and clock, then
//! feeds it three kinds of input:
//!
//! - signaling messages ([`CollabSession::handle_signal`])
//! - transport events ([`CollabSession::handle_transport_event`])
//! - timer ticks ([`CollabSession::tick`])
//!
//! Outgoing signaling accumulates in an outbox the host empties with
//! [`CollabSession::drain_signals`]. Observers subscribe to [`BoardEvent`]s.

use crate::change::{BoardChange, ChangePayload, ConflictCategory, ConflictRecord};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::events::{BoardEvent, EventBus, Subscription};
use crate::ids::{BoardId, CollaboratorId, SessionId, TileId};
use crate::lock::{LockCoordinator, contention_winner};
use crate::model::{
    BoardSettingsPatch, Collaborator, CollaboratorStatus, Permission, Role, Session, SessionKind,
    SessionSettings, SharedBoard, Tile, TileContent, TilePatch,
};
use crate::peer::{ConnectionError, PeerConnectionManager, PeerOutput};
use crate::persistence::{BoardPersistence, PersistenceError};
use crate::presence::{PresenceBroadcaster, PresenceUpdate};
use crate::protocol::PeerMessage;
use crate::signaling::{
    CollaboratorProfile, JoinAnnounce, LeaveAnnounce, RelayPayload, SignalMessage, SignalPayload,
};
use crate::store::{BoardStore, StoreError};
use crate::sync::{ChangeSynchronizer, SyncOutcome};
use crate::transport::{PeerTransport, TransportEvent};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active board session")]
    NoActiveSession,

    #[error("A board session is already active")]
    AlreadyActive,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// State that only exists while a board is open.
struct ActiveBoard {
    session: Session,
    store: BoardStore,
    sync: ChangeSynchronizer,
    locks: LockCoordinator,
    presence: PresenceBroadcaster,
    /// Waiting for a peer's snapshot (we joined an existing board)
    needs_snapshot: bool,
    /// A peer refused one of our changes; its snapshot replaces our copy
    /// whatever its version
    resync_from: Option<CollaboratorId>,
    last_saved: u64,
    last_heartbeat: u64,
}

pub struct CollabSession<T: PeerTransport, P: BoardPersistence> {
    local: CollaboratorId,
    display_name: String,
    config: SessionConfig,
    clock: Arc<dyn Clock + Send + Sync>,
    peers: PeerConnectionManager<T>,
    persistence: P,
    events: Arc<EventBus>,
    active: Option<ActiveBoard>,
    outbox: Vec<SignalMessage>,
}

impl<T: PeerTransport, P: BoardPersistence> CollabSession<T, P> {
    pub fn new(
        local: CollaboratorId,
        display_name: impl Into<String>,
        transport: T,
        persistence: P,
        config: SessionConfig,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let peers = PeerConnectionManager::new(local, transport, config.peer());
        Self {
            local,
            display_name: display_name.into(),
            config,
            clock,
            peers,
            persistence,
            events: Arc::new(EventBus::new()),
            active: None,
            outbox: Vec::new(),
        }
    }

    pub fn local_id(&self) -> CollaboratorId {
        self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn subscribe(&self, callback: impl Fn(BoardEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn board(&self) -> Option<&SharedBoard> {
        self.active.as_ref().map(|a| a.store.board())
    }

    pub fn snapshot(&self) -> Result<SharedBoard> {
        self.active
            .as_ref()
            .map(|a| a.store.snapshot())
            .ok_or(SessionError::NoActiveSession)
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.active
            .as_ref()
            .map(|a| a.sync.conflicts())
            .unwrap_or_default()
    }

    /// Latest presence received from `id`.
    pub fn presence_of(&self, id: &CollaboratorId) -> Option<PresenceUpdate> {
        self.active
            .as_ref()
            .and_then(|a| a.presence.latest(id))
            .map(|p| p.update.clone())
    }

    pub fn pending_changes(&self) -> usize {
        self.active
            .as_ref()
            .map(|a| a.sync.pending_count())
            .unwrap_or(0)
    }

    pub fn peers(&self) -> &PeerConnectionManager<T> {
        &self.peers
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Signaling messages to send, oldest first.
    pub fn drain_signals(&mut self) -> Vec<SignalMessage> {
        std::mem::take(&mut self.outbox)
    }

    fn active_mut(&mut self) -> Result<&mut ActiveBoard> {
        self.active.as_mut().ok_or(SessionError::NoActiveSession)
    }

    // ==================== Lifecycle ====================

    pub fn create_shared_board(
        &mut self,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<SharedBoard> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let now = self.clock.now_ms();
        let owner = Collaborator::new(self.local, self.display_name.clone(), Role::Owner, now);
        let store = BoardStore::create(name, description, owner, self.config.max_collaborators, now);
        info!("Created board {} ({})", store.board().name, store.board().id);
        self.activate(store, false, now)
    }

    pub fn join_shared_board(&mut self, board_id: BoardId) -> Result<SharedBoard> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let now = self.clock.now_ms();

        let mut store = match self.persistence.load(&board_id)? {
            Some(saved) => {
                debug!("Reopening saved copy of {} at version {}", board_id, saved.version);
                let mut store = BoardStore::open(self.local, saved, self.config.max_collaborators);
                store.mark_others_offline();
                store
            }
            None => BoardStore::open(
                self.local,
                SharedBoard::placeholder(board_id, self.local, now),
                self.config.max_collaborators,
            ),
        };

        let role = store
            .board()
            .collaborator(&self.local)
            .map(|c| c.role)
            .unwrap_or(Role::Editor);
        store.join(Collaborator::new(self.local, self.display_name.clone(), role, now))?;
        info!("Joining board {}", board_id);
        self.activate(store, true, now)
    }

    fn activate(&mut self, store: BoardStore, needs_snapshot: bool, now: u64) -> Result<SharedBoard> {
        let settings = SessionSettings::default();
        let mut locks = LockCoordinator::new(self.config.lock());
        locks.seed(store.board(), now);
        let mut presence = PresenceBroadcaster::new(self.config.presence());
        if settings.cursor_share {
            presence.start();
        }

        self.persistence.save(store.board())?;
        let snapshot = store.snapshot();
        self.active = Some(ActiveBoard {
            session: Session {
                id: SessionId::new(),
                kind: SessionKind::SharedBoard,
                board_id: snapshot.id,
                created_at: now,
                active: true,
                settings,
            },
            store,
            sync: ChangeSynchronizer::new(self.config.sync()),
            locks,
            presence,
            needs_snapshot,
            resync_from: None,
            last_saved: now,
            last_heartbeat: now,
        });
        self.announce();
        Ok(snapshot)
    }

    /// Leave the board: release our locks, say goodbye, close every link.
    pub fn leave_shared_board(&mut self) -> Result<()> {
        let local = self.local;
        let Some(mut active) = self.active.take() else {
            return Err(SessionError::NoActiveSession);
        };

        for tile_id in active.store.locks_held_by(&local) {
            active.store.force_unlock(tile_id);
            let release = PeerMessage::Lock {
                tile_id,
                holder: local,
                locked: false,
            };
            self.peers.broadcast(&release.to_json());
        }

        let board_id = active.store.board().id;
        self.outbox.push(SignalMessage::broadcast(
            local,
            SignalPayload::Leave(LeaveAnnounce { board_id }),
        ));

        active.store.set_status(&local, CollaboratorStatus::Offline);
        if let Err(e) = self.persistence.save(active.store.board()) {
            error!("Failed to save board {} on leave: {}", board_id, e);
        }

        self.peers.close_all();
        active.presence.stop();
        active.locks.clear();
        active.sync.reset();
        active.session.active = false;
        info!("Left board {}", board_id);
        Ok(())
    }

    /// Re-announce ourselves after the signaling connection came back; peers
    /// may have treated the drop as a leave.
    pub fn on_signaling_reconnected(&mut self) {
        if self.active.is_some() {
            info!("Signaling reconnected, re-announcing");
            self.announce();
        }
    }

    fn announce(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let board = active.store.board();
        let role = board
            .collaborator(&self.local)
            .map(|c| c.role)
            .unwrap_or(Role::Editor);
        self.outbox.push(SignalMessage::broadcast(
            self.local,
            SignalPayload::Join(JoinAnnounce {
                board_id: board.id,
                profile: CollaboratorProfile {
                    display_name: self.display_name.clone(),
                    role,
                },
            }),
        ));
    }

    // ==================== Board operations ====================

    pub fn add_tile(&mut self, content: TileContent) -> Result<Tile> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        let (tile, change) = active.store.add_tile(content, now)?;
        active.store.touch(&local, now);
        Self::publish_local(active, &mut self.peers, &change);
        self.events.emit(BoardEvent::TileAdded {
            tile: tile.clone(),
            by: local,
        });
        Ok(tile)
    }

    pub fn edit_tile(&mut self, tile_id: TileId, patch: TilePatch) -> Result<Tile> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        let (tile, change) = active.store.edit_tile(tile_id, patch, now)?;
        active.store.touch(&local, now);
        active.locks.touch(&tile_id, &local, now);
        Self::publish_local(active, &mut self.peers, &change);
        self.events.emit(BoardEvent::TileEdited {
            tile: tile.clone(),
            by: local,
        });
        Ok(tile)
    }

    pub fn delete_tile(&mut self, tile_id: TileId) -> Result<()> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        let change = active.store.delete_tile(tile_id, now)?;
        active.store.touch(&local, now);
        active.locks.released(&tile_id);
        active.presence.deselect(&tile_id);
        Self::publish_local(active, &mut self.peers, &change);
        self.events.emit(BoardEvent::TileDeleted { tile_id, by: local });
        Ok(())
    }

    pub fn update_settings(&mut self, patch: BoardSettingsPatch) -> Result<()> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        let change = active.store.update_settings(patch, now)?;
        active.store.touch(&local, now);
        Self::publish_local(active, &mut self.peers, &change);
        self.events.emit(BoardEvent::SettingsChanged { by: local });
        Ok(())
    }

    /// Broadcast a local change and track it until every recipient acks.
    fn publish_local(
        active: &mut ActiveBoard,
        peers: &mut PeerConnectionManager<T>,
        change: &BoardChange,
    ) {
        if !active.session.settings.board_sync {
            active.sync.record_local(change, HashSet::new());
            return;
        }
        let msg = PeerMessage::Change {
            change: change.clone(),
        };
        let sent = peers.broadcast(&msg.to_json());
        debug!(
            "Broadcast {:?} {} to {} peers",
            change.kind(),
            change.id,
            sent.len()
        );
        active.sync.record_local(change, sent.into_iter().collect());
    }

    /// Acquire a lock on a tile. Returns false if the tile is already locked,
    /// by us or anyone else; see [`CollabSession::renew_lock`] for extending
    /// a lock we hold.
    pub fn lock_tile(&mut self, tile_id: TileId) -> Result<bool> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        active.store.check(Permission::LockTile)?;
        if !active.store.lock_tile(tile_id, local)? {
            return Ok(false);
        }
        active.locks.granted(tile_id, local, now);
        active.store.touch(&local, now);
        if active.session.settings.board_sync {
            let msg = PeerMessage::Lock {
                tile_id,
                holder: local,
                locked: true,
            };
            self.peers.broadcast(&msg.to_json());
        }
        self.events.emit(BoardEvent::TileLocked {
            tile_id,
            holder: local,
        });
        Ok(true)
    }

    /// Extend the lease on a lock we hold and tell peers to do the same.
    /// Returns false if we do not hold it.
    pub fn renew_lock(&mut self, tile_id: TileId) -> Result<bool> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        let tile = active
            .store
            .tile(&tile_id)
            .ok_or(StoreError::TileNotFound(tile_id))?;
        if tile.lock.holder() != Some(local) {
            return Ok(false);
        }
        active.locks.granted(tile_id, local, now);
        active.store.touch(&local, now);
        if active.session.settings.board_sync {
            let msg = PeerMessage::Lock {
                tile_id,
                holder: local,
                locked: true,
            };
            self.peers.broadcast(&msg.to_json());
        }
        Ok(true)
    }

    /// Release our lock on a tile. Returns false if we did not hold it.
    pub fn unlock_tile(&mut self, tile_id: TileId) -> Result<bool> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        if !active.store.unlock_tile(tile_id, local)? {
            return Ok(false);
        }
        active.locks.released(&tile_id);
        active.store.touch(&local, now);
        if active.session.settings.board_sync {
            let msg = PeerMessage::Lock {
                tile_id,
                holder: local,
                locked: false,
            };
            self.peers.broadcast(&msg.to_json());
        }
        self.events.emit(BoardEvent::TileUnlocked {
            tile_id,
            holder: local,
            expired: false,
        });
        Ok(true)
    }

    pub fn update_session_settings(&mut self, settings: SessionSettings) -> Result<()> {
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        let before = active.session.settings;
        active.session.settings = settings;

        if settings.cursor_share != before.cursor_share {
            if settings.cursor_share {
                active.presence.start();
            } else {
                active.presence.stop();
            }
        }

        if settings.board_sync && !before.board_sync {
            // Catch up with whatever happened while we were local-only
            info!("Board sync re-enabled, requesting snapshot");
            active.needs_snapshot = true;
            let request = PeerMessage::SnapshotRequest {
                board_id: active.store.board().id,
            };
            for peer in self.peers.connected_peers() {
                Self::send_to(&mut self.peers, peer, &request);
            }
        }
        Ok(())
    }

    pub fn update_cursor_position(&mut self, x: f64, y: f64) -> Result<()> {
        self.active_mut()?.presence.set_cursor(x, y);
        Ok(())
    }

    pub fn set_selection(&mut self, selection: Vec<TileId>) -> Result<()> {
        self.active_mut()?.presence.set_selection(selection);
        Ok(())
    }

    pub fn set_typing(&mut self, typing: bool) -> Result<()> {
        self.active_mut()?.presence.set_typing(typing);
        Ok(())
    }

    /// Grant `user` a role on the board and notify them over signaling.
    pub fn invite_user(&mut self, user: CollaboratorId, role: Role) -> Result<()> {
        let now = self.clock.now_ms();
        let local = self.local;
        let active = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        active.store.check(Permission::Invite)?;

        let mut invited = Collaborator::new(user, user.to_string(), role, now);
        invited.status = CollaboratorStatus::Offline;
        active.store.invite(invited);

        let board_id = active.store.board().id;
        info!("Invited {} to {} as {:?}", user, board_id, role);
        self.outbox.push(SignalMessage::directed(
            local,
            user,
            SignalPayload::Relay(RelayPayload::Invite { board_id, role }),
        ));
        Ok(())
    }

    // ==================== Signaling ====================

    pub fn handle_signal(&mut self, msg: SignalMessage) {
        if msg.from == self.local {
            return;
        }
        if msg.to.is_some_and(|to| to != self.local) {
            return;
        }
        let now = self.clock.now_ms();
        let from = msg.from;
        let directed = msg.to.is_some();

        let outputs = match msg.payload {
            SignalPayload::Join(join) => self.on_join(from, join, directed, now),
            SignalPayload::Leave(leave) => {
                self.on_leave(from, leave.board_id);
                Vec::new()
            }
            SignalPayload::Offer(offer) => {
                if self.active.is_none() {
                    debug!("Ignoring offer from {} outside a session", from);
                    return;
                }
                self.peers.handle_offer(from, &offer, now)
            }
            SignalPayload::Answer(answer) => self.peers.handle_answer(from, &answer, now),
            SignalPayload::Candidate(candidate) => self.peers.handle_candidate(from, candidate, now),
            SignalPayload::Relay(relay) => {
                self.on_relay(from, relay);
                Vec::new()
            }
        };
        self.process_outputs(outputs, now);
    }

    fn on_join(
        &mut self,
        from: CollaboratorId,
        join: JoinAnnounce,
        directed: bool,
        now: u64,
    ) -> Vec<PeerOutput> {
        let local = self.local;
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let board = active.store.board();
        if join.board_id != board.id {
            debug!("Ignoring join for board {} from {}", join.board_id, from);
            return Vec::new();
        }

        // Only the board's owner can claim ownership
        let role = if join.profile.role == Role::Owner && from != board.owner {
            Role::Editor
        } else {
            join.profile.role
        };
        let was_present = board
            .collaborator(&from)
            .map(|c| c.is_present())
            .unwrap_or(false);

        let joined = active
            .store
            .join(Collaborator::new(from, join.profile.display_name, role, now));
        if let Err(e) = joined {
            warn!("Rejecting join from {}: {}", from, e);
            if !directed {
                self.outbox.push(SignalMessage::directed(
                    local,
                    from,
                    SignalPayload::Relay(RelayPayload::JoinRejected {
                        board_id: join.board_id,
                        reason: e.to_string(),
                    }),
                ));
            }
            return Vec::new();
        }

        if !was_present {
            if let Some(collaborator) = active.store.board().collaborator(&from) {
                info!("{} joined board {}", from, join.board_id);
                self.events.emit(BoardEvent::CollaboratorJoined {
                    collaborator: collaborator.clone(),
                });
            }
        }

        if directed {
            // A reply to our own announce: they will offer
            return Vec::new();
        }

        let own_role = active
            .store
            .board()
            .collaborator(&local)
            .map(|c| c.role)
            .unwrap_or(Role::Editor);
        self.outbox.push(SignalMessage::directed(
            local,
            from,
            SignalPayload::Join(JoinAnnounce {
                board_id: join.board_id,
                profile: CollaboratorProfile {
                    display_name: self.display_name.clone(),
                    role: own_role,
                },
            }),
        ));
        self.peers.connect(from, now)
    }

    fn on_leave(&mut self, from: CollaboratorId, board_id: BoardId) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.store.board().id != board_id {
            return;
        }

        active.locks.release_holder(&from);
        for tile_id in active.store.locks_held_by(&from) {
            active.store.force_unlock(tile_id);
            self.events.emit(BoardEvent::TileUnlocked {
                tile_id,
                holder: from,
                expired: false,
            });
        }
        active.presence.forget(&from);
        active.sync.forget_peer(&from);
        self.peers.disconnect(&from);

        if active.store.leave(&from).is_some() {
            info!("{} left board {}", from, board_id);
            self.events.emit(BoardEvent::CollaboratorLeft { id: from });
        }
    }

    fn on_relay(&mut self, from: CollaboratorId, relay: RelayPayload) {
        match relay {
            RelayPayload::JoinRejected { board_id, reason } => {
                let ours = self
                    .active
                    .as_ref()
                    .map(|a| a.store.board().id == board_id && a.needs_snapshot)
                    .unwrap_or(false);
                if !ours {
                    return;
                }
                warn!("Join of {} rejected by {}: {}", board_id, from, reason);
                self.peers.close_all();
                self.active = None;
                self.events.emit(BoardEvent::JoinRejected { reason });
            }
            RelayPayload::Invite { board_id, role } => {
                info!("Invited to {} as {:?} by {}", board_id, role, from);
                self.events.emit(BoardEvent::Invited {
                    board_id,
                    role,
                    by: from,
                });
            }
        }
    }

    // ==================== Transport ====================

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let now = self.clock.now_ms();
        let outputs = self.peers.handle_transport_event(event, now);
        self.process_outputs(outputs, now);
    }

    fn process_outputs(&mut self, outputs: Vec<PeerOutput>, now: u64) {
        for output in outputs {
            match output {
                PeerOutput::Signal(signal) => self.outbox.push(signal),
                PeerOutput::Connected { peer } => self.on_connected(peer, now),
                PeerOutput::Unreachable {
                    peer,
                    retrying,
                    reason,
                } => {
                    debug!("{} unreachable: {}", peer, reason);
                    self.events.emit(BoardEvent::PeerUnreachable { peer, retrying });
                    self.on_peer_lost(peer);
                }
                PeerOutput::Closed { peer } => self.on_peer_lost(peer),
                PeerOutput::Message { peer, data } => self.on_peer_message(peer, &data, now),
            }
        }
    }

    fn on_connected(&mut self, peer: CollaboratorId, now: u64) {
        self.events.emit(BoardEvent::PeerConnected { peer });
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.store.touch(&peer, now) {
            self.events.emit(BoardEvent::CollaboratorStatusChanged {
                id: peer,
                status: CollaboratorStatus::Online,
            });
        }
        if active.needs_snapshot && active.session.settings.board_sync {
            let request = PeerMessage::SnapshotRequest {
                board_id: active.store.board().id,
            };
            Self::send_to(&mut self.peers, peer, &request);
        }
    }

    /// The link is gone (possibly pending a retry). A later `Connected`
    /// brings the collaborator back online.
    fn on_peer_lost(&mut self, peer: CollaboratorId) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.sync.forget_peer(&peer);
        active.presence.forget(&peer);
        if active.resync_from == Some(peer) {
            active.resync_from = None;
        }
        if active.store.set_status(&peer, CollaboratorStatus::Offline) {
            info!("{} is offline", peer);
            self.events.emit(BoardEvent::CollaboratorStatusChanged {
                id: peer,
                status: CollaboratorStatus::Offline,
            });
        }
    }

    fn on_peer_message(&mut self, from: CollaboratorId, data: &[u8], now: u64) {
        let msg = match PeerMessage::from_json(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping message from {}: {}", from, e);
                return;
            }
        };
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let syncing = active.session.settings.board_sync;

        match msg {
            PeerMessage::Change { change } => {
                if let ChangePayload::UserCursor(update) = &change.payload {
                    if !active.presence.is_running() {
                        return;
                    }
                    let changed = active
                        .presence
                        .latest(&change.author)
                        .map(|p| &p.update != update)
                        .unwrap_or(true);
                    if active
                        .presence
                        .receive(change.author, update.clone(), change.timestamp, now)
                    {
                        active.store.set_cursor(&change.author, update.cursor);
                        if changed {
                            Self::note_activity(active, &self.events, change.author, now);
                            self.events.emit(BoardEvent::PresenceUpdated {
                                id: change.author,
                                presence: update.clone(),
                            });
                        }
                    }
                    return;
                }
                if !syncing {
                    debug!("Local-only mode, dropping change {}", change.id);
                    return;
                }

                match active.sync.reconcile(&mut active.store, &change, now) {
                    SyncOutcome::Applied { conflict } => {
                        Self::note_activity(active, &self.events, change.author, now);
                        if let Some(tile_id) = change.tile_id() {
                            active.locks.touch(&tile_id, &change.author, now);
                        }
                        if let Some(event) = Self::applied_event(active, &change) {
                            self.events.emit(event);
                        }
                        if let Some(record) = conflict {
                            self.events.emit(BoardEvent::ConflictRecorded { record });
                        }
                        Self::send_to(&mut self.peers, from, &PeerMessage::Ack { change_id: change.id });
                    }
                    SyncOutcome::Duplicate => {
                        Self::send_to(&mut self.peers, from, &PeerMessage::Ack { change_id: change.id });
                    }
                    SyncOutcome::Rejected { conflict } => {
                        let reply = PeerMessage::Rejected {
                            change_id: change.id,
                            category: conflict.category,
                        };
                        self.events.emit(BoardEvent::ConflictRecorded { record: conflict });
                        Self::send_to(&mut self.peers, from, &reply);
                    }
                    SyncOutcome::Ignored => {}
                }
            }
            PeerMessage::Ack { change_id } => {
                if active.sync.acknowledge(&change_id, &from) {
                    debug!("Change {} acknowledged by all peers", change_id);
                }
            }
            PeerMessage::Lock {
                tile_id,
                holder,
                locked,
            } => {
                if !syncing {
                    return;
                }
                Self::note_activity(active, &self.events, holder, now);
                let events = if locked {
                    Self::remote_lock(active, self.local, tile_id, holder, now)
                } else {
                    Self::remote_unlock(active, tile_id, holder)
                };
                for event in events {
                    self.events.emit(event);
                }
            }
            PeerMessage::SnapshotRequest { board_id } => {
                if !syncing || board_id != active.store.board().id {
                    return;
                }
                let reply = PeerMessage::Snapshot {
                    board: active.store.snapshot(),
                    recent_changes: active.sync.recent(),
                };
                debug!("Sending snapshot of {} to {}", board_id, from);
                Self::send_to(&mut self.peers, from, &reply);
            }
            PeerMessage::Snapshot {
                board,
                recent_changes,
            } => {
                let resync = active.resync_from == Some(from);
                if !(active.needs_snapshot || resync) || board.id != active.store.board().id {
                    debug!("Ignoring unrequested snapshot from {}", from);
                    return;
                }
                active.needs_snapshot = false;
                active.resync_from = None;
                if !resync && board.version < active.store.version() {
                    info!(
                        "Keeping local copy (version {}) over snapshot version {} from {}",
                        active.store.version(),
                        board.version,
                        from
                    );
                    return;
                }
                let version = board.version;
                active.store.adopt(board);
                active.sync.seed(&recent_changes);
                if resync {
                    // Whatever the peer had not acked is not in its snapshot
                    for change in active.sync.unacked_by(&from) {
                        match active.store.apply(&change.author, &change.payload, now) {
                            Ok(()) => active.store.observe_version(change.target_version),
                            Err(e) => debug!("Not replaying {} after resync: {}", change.id, e),
                        }
                    }
                    info!("Resynced to snapshot version {} from {}", version, from);
                } else {
                    info!("Adopted snapshot version {} from {}", version, from);
                }
                active.locks.seed(active.store.board(), now);
                if let Err(e) = self.persistence.save(active.store.board()) {
                    error!("Failed to save adopted snapshot: {}", e);
                }
                active.last_saved = now;
                self.events.emit(BoardEvent::SnapshotAdopted { version });
            }
            PeerMessage::Rejected {
                change_id,
                category,
            } => {
                active.sync.rejected_by_peer(&change_id);
                warn!("Change {} rejected by {} ({:?})", change_id, from, category);
                // A stale change lost to one we will receive anyway. Anything
                // else means our copy holds what the peer refused.
                if syncing && category != ConflictCategory::StaleVersion {
                    info!("Requesting snapshot from {} to resync", from);
                    active.resync_from = Some(from);
                    let request = PeerMessage::SnapshotRequest {
                        board_id: active.store.board().id,
                    };
                    Self::send_to(&mut self.peers, from, &request);
                }
                self.events.emit(BoardEvent::ChangeRejected {
                    change_id,
                    by: from,
                    category,
                });
            }
            PeerMessage::Heartbeat => {}
        }
    }

    fn note_activity(active: &mut ActiveBoard, events: &EventBus, who: CollaboratorId, now: u64) {
        if active.store.touch(&who, now) {
            events.emit(BoardEvent::CollaboratorStatusChanged {
                id: who,
                status: CollaboratorStatus::Online,
            });
        }
    }

    fn applied_event(active: &mut ActiveBoard, change: &BoardChange) -> Option<BoardEvent> {
        let by = change.author;
        match &change.payload {
            ChangePayload::TileAdd(tile) => active
                .store
                .tile(&tile.id)
                .cloned()
                .map(|tile| BoardEvent::TileAdded { tile, by }),
            ChangePayload::TileEdit(edit) => active
                .store
                .tile(&edit.tile_id)
                .cloned()
                .map(|tile| BoardEvent::TileEdited { tile, by }),
            ChangePayload::TileDelete(delete) => {
                active.locks.released(&delete.tile_id);
                active.presence.deselect(&delete.tile_id);
                Some(BoardEvent::TileDeleted {
                    tile_id: delete.tile_id,
                    by,
                })
            }
            ChangePayload::BoardSettings(_) => Some(BoardEvent::SettingsChanged { by }),
            ChangePayload::UserCursor(_) => None,
        }
    }

    fn remote_lock(
        active: &mut ActiveBoard,
        local: CollaboratorId,
        tile_id: TileId,
        holder: CollaboratorId,
        now: u64,
    ) -> Vec<BoardEvent> {
        let current = match active.store.tile(&tile_id) {
            Some(tile) => tile.lock.holder(),
            None => {
                warn!("Lock from {} for unknown tile {}", holder, tile_id);
                return Vec::new();
            }
        };

        match current {
            None => {
                if let Err(e) = active.store.lock_tile(tile_id, holder) {
                    warn!("Failed to record lock on {}: {}", tile_id, e);
                    return Vec::new();
                }
                active.locks.granted(tile_id, holder, now);
                vec![BoardEvent::TileLocked { tile_id, holder }]
            }
            Some(current) if current == holder => {
                active.locks.granted(tile_id, holder, now);
                Vec::new()
            }
            Some(current) => {
                if contention_winner(current, holder) != holder {
                    debug!("Lock on {} stays with {} over {}", tile_id, current, holder);
                    return Vec::new();
                }
                if let Err(e) = active.store.force_lock(tile_id, holder) {
                    warn!("Failed to record lock on {}: {}", tile_id, e);
                    return Vec::new();
                }
                active.locks.granted(tile_id, holder, now);
                let mut events = Vec::new();
                if current == local {
                    info!("Lost lock on {} to {}", tile_id, holder);
                    events.push(BoardEvent::LockLost {
                        tile_id,
                        winner: holder,
                    });
                }
                events.push(BoardEvent::TileLocked { tile_id, holder });
                events
            }
        }
    }

    fn remote_unlock(
        active: &mut ActiveBoard,
        tile_id: TileId,
        holder: CollaboratorId,
    ) -> Vec<BoardEvent> {
        match active.store.unlock_tile(tile_id, holder) {
            Ok(true) => {
                active.locks.released(&tile_id);
                vec![BoardEvent::TileUnlocked {
                    tile_id,
                    holder,
                    expired: false,
                }]
            }
            Ok(false) => Vec::new(),
            Err(e) => {
                debug!("Ignoring unlock from {}: {}", holder, e);
                Vec::new()
            }
        }
    }

    fn send_to(peers: &mut PeerConnectionManager<T>, peer: CollaboratorId, msg: &PeerMessage) {
        if let Err(e) = peers.send_to(peer, &msg.to_json()) {
            debug!("Dropping {} for {}: {}", msg.kind(), peer, e);
        }
    }

    // ==================== Timers ====================

    /// Drive every timer: lock expiry, negotiation and liveness timeouts,
    /// presence broadcast, away detection and the periodic snapshot save.
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        self.expire_locks(now);

        let outputs = self.peers.tick(now);
        self.process_outputs(outputs, now);

        let local = self.local;
        let away_after = self.config.away_after_ms;
        let snapshot_interval = self.config.snapshot_interval_ms;
        let heartbeat_ms = self.config.presence_heartbeat_ms;
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if let Some(update) = active.presence.poll(now) {
            let change = BoardChange::new(
                active.store.board().id,
                local,
                ChangePayload::UserCursor(update),
                now,
                active.store.version(),
            );
            self.peers
                .broadcast(&PeerMessage::Change { change }.to_json());
        } else if !active.presence.is_running()
            && now.saturating_sub(active.last_heartbeat) >= heartbeat_ms
        {
            self.peers.broadcast(&PeerMessage::Heartbeat.to_json());
            active.last_heartbeat = now;
        }

        for id in active.store.idle_since(now.saturating_sub(away_after)) {
            if active.store.set_status(&id, CollaboratorStatus::Away) {
                debug!("{} is away", id);
                self.events.emit(BoardEvent::CollaboratorStatusChanged {
                    id,
                    status: CollaboratorStatus::Away,
                });
            }
        }

        if now.saturating_sub(active.last_saved) >= snapshot_interval {
            if let Err(e) = self.persistence.save(active.store.board()) {
                error!("Failed to save board {}: {}", active.store.board().id, e);
            }
            active.last_saved = now;
        }
    }

    fn expire_locks(&mut self, now: u64) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        for (tile_id, holder) in active.locks.expired(now) {
            if active.store.tile(&tile_id).and_then(|t| t.lock.holder()) != Some(holder) {
                continue;
            }
            active.store.force_unlock(tile_id);
            info!("Lock on {} held by {} expired", tile_id, holder);
            if active.session.settings.board_sync {
                let release = PeerMessage::Lock {
                    tile_id,
                    holder,
                    locked: false,
                };
                self.peers.broadcast(&release.to_json());
            }
            self.events.emit(BoardEvent::TileUnlocked {
                tile_id,
                holder,
                expired: true,
            });
        }
    }
}
