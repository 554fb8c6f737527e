//! Runs one collaboration session on the current task.
//!
//! The session is single-threaded. Everything that does IO (the signaling
//! client, the peer listener, each peer link) lives on its own task and
//! reaches the session through an unbounded channel; [`PeerHost::step`]
//! waits for the next input, feeds it in, and ships whatever signaling the
//! session produced.

use crate::direct::DirectTransport;
use crate::file_store::JsonBoardStore;
use crate::signaling::{SignalingClient, SignalingEvent};
use anyhow::{Context, Result};
use board_core::{
    BoardId, CollabSession, CollaboratorId, SessionConfig, SharedBoard, SystemClock,
    TransportEvent,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type HostSession = CollabSession<DirectTransport, JsonBoardStore>;

/// How often timers are driven. Matches the presence cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub enum BoardTarget {
    Create {
        name: String,
        description: Option<String>,
    },
    Join(BoardId),
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub signaling_url: String,
    pub listen: String,
    pub advertise: Option<String>,
    pub display_name: String,
    pub target: BoardTarget,
    pub data_dir: PathBuf,
    pub config: SessionConfig,
    /// Generated (and remembered in `data_dir`) if not given
    pub peer_id: Option<CollaboratorId>,
}

pub struct PeerHost {
    session: HostSession,
    signaling: SignalingClient,
    signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ticker: Interval,
    signaling_up: bool,
}

impl PeerHost {
    /// Open or join the board and start networking.
    pub async fn start(options: PeerOptions) -> Result<Self> {
        options.config.validate().context("Invalid session config")?;
        fs::create_dir_all(&options.data_dir)
            .with_context(|| format!("Failed to create {:?}", options.data_dir))?;

        let local = match options.peer_id {
            Some(id) => id,
            None => load_or_create_peer_id(&options.data_dir)?,
        };
        info!("Peer {} ({})", local, options.display_name);

        let (transport, transport_events) =
            DirectTransport::bind(&options.listen, options.advertise.clone(), local).await?;
        let persistence = JsonBoardStore::new(&options.data_dir)?;

        let mut session = CollabSession::new(
            local,
            options.display_name.clone(),
            transport,
            persistence,
            options.config.clone(),
            Arc::new(SystemClock),
        );

        let board = match &options.target {
            BoardTarget::Create { name, description } => {
                session.create_shared_board(name.clone(), description.clone())?
            }
            BoardTarget::Join(board_id) => session.join_shared_board(*board_id)?,
        };
        info!("Board {} open at version {}", board.id, board.version);

        let (signaling, signaling_events) = SignalingClient::spawn(
            options.signaling_url.clone(),
            local,
            options.config.reconnect(),
        );

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            session,
            signaling,
            signaling_events,
            transport_events,
            ticker,
            signaling_up: false,
        })
    }

    pub fn session(&self) -> &HostSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut HostSession {
        &mut self.session
    }

    pub fn local_id(&self) -> CollaboratorId {
        self.session.local_id()
    }

    pub fn board(&self) -> Option<&SharedBoard> {
        self.session.board()
    }

    /// Wait for the next input, feed it to the session, ship its signals.
    pub async fn step(&mut self) {
        tokio::select! {
            _ = self.ticker.tick() => self.session.tick(),
            Some(event) = self.signaling_events.recv() => self.on_signaling(event),
            Some(event) = self.transport_events.recv() => {
                self.session.handle_transport_event(event);
            }
        }
        self.flush();
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                self.signaling_up = true;
                self.session.on_signaling_reconnected();
            }
            SignalingEvent::Disconnected => self.signaling_up = false,
            SignalingEvent::Message(msg) => self.session.handle_signal(msg),
        }
    }

    /// Ship queued signaling. Signals produced while the relay is down are
    /// dropped; reconnecting re-announces us.
    pub fn flush(&mut self) {
        let signals = self.session.drain_signals();
        if !self.signaling_up {
            if !signals.is_empty() {
                debug!("Relay down, dropping {} signal(s)", signals.len());
            }
            return;
        }
        for msg in signals {
            self.signaling.send(msg);
        }
    }

    /// Leave the board (if still on it) and stop networking.
    pub async fn shutdown(mut self) {
        if self.session.is_active() {
            if let Err(e) = self.session.leave_shared_board() {
                warn!("Failed to leave board cleanly: {}", e);
            }
        }
        self.flush();
        self.signaling.close().await;
        info!("Peer {} stopped", self.session.local_id());
    }
}

/// Read the collaborator id stored in `data_dir`, creating one on first run.
pub fn load_or_create_peer_id(data_dir: &Path) -> Result<CollaboratorId> {
    let path = data_dir.join("peer_id");
    if path.exists() {
        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {path:?}"))?;
        return contents
            .trim()
            .parse()
            .with_context(|| format!("Invalid peer id in {path:?}"));
    }
    let id = CollaboratorId::generate();
    fs::write(&path, id.to_string()).with_context(|| format!("Failed to write {path:?}"))?;
    info!("Generated peer ID: {}", id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_peer_id_is_remembered() {
        let temp_dir = TempDir::new().unwrap();
        let first = load_or_create_peer_id(temp_dir.path()).unwrap();
        let second = load_or_create_peer_id(temp_dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_garbage_peer_id_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("peer_id"), "not-hex").unwrap();
        assert!(load_or_create_peer_id(temp_dir.path()).is_err());
    }
}
