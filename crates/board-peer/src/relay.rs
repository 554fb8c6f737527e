//! Minimal rendezvous relay.
//!
//! One room. A client registers by sending a [`Handshake`] as its first
//! frame; after that every text frame must be a signaling envelope sent in
//! the client's own name. Directed envelopes go to the named client,
//! broadcasts to every other registered client. The relay never looks
//! inside payloads beyond validating them.

use crate::link::{LinkEvent, WsLink};
use anyhow::{Context, Result};
use board_core::protocol::Handshake;
use board_core::{CollaboratorId, SignalMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

pub struct Relay {
    listener: TcpListener,
}

impl Relay {
    pub async fn bind(listen_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind relay to {listen_addr}"))?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the listener fails.
    pub async fn run(self) -> Result<()> {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let (upgraded_tx, mut upgraded_rx) = mpsc::unbounded_channel();
        let mut room = Room::new(link_tx);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted.context("Relay accept failed")?;
                    let upgraded_tx = upgraded_tx.clone();
                    tokio::spawn(async move {
                        if let Some(ws) = upgrade(stream, addr).await {
                            let _ = upgraded_tx.send(ws);
                        }
                    });
                }
                Some(ws) = upgraded_rx.recv() => room.admit(ws),
                Some(event) = link_rx.recv() => room.handle(event),
            }
        }
    }
}

async fn upgrade(stream: TcpStream, addr: SocketAddr) -> Option<WebSocketStream<TcpStream>> {
    match accept_async(stream).await {
        Ok(ws) => {
            debug!("New relay connection from {}", addr);
            Some(ws)
        }
        Err(e) => {
            // Health checks connect and close without upgrading
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before upgrade from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            None
        }
    }
}

/// Registered clients and connections still waiting to register.
struct Room {
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    next_conn_id: u64,
    pending: HashMap<u64, WsLink>,
    members: HashMap<CollaboratorId, WsLink>,
    conn_to_member: HashMap<u64, CollaboratorId>,
}

impl Room {
    fn new(link_tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            link_tx,
            next_conn_id: 1,
            pending: HashMap::new(),
            members: HashMap::new(),
            conn_to_member: HashMap::new(),
        }
    }

    fn admit(&mut self, ws: WebSocketStream<TcpStream>) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.pending
            .insert(conn_id, WsLink::spawn(conn_id, ws, self.link_tx.clone()));
    }

    fn handle(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame { conn_id, data } => {
                if let Some(member) = self.conn_to_member.get(&conn_id).copied() {
                    self.forward(member, &data);
                } else {
                    self.register(conn_id, &data);
                }
            }
            LinkEvent::Closed { conn_id } => {
                if self.pending.remove(&conn_id).is_some() {
                    debug!("Connection {} closed before registering", conn_id);
                    return;
                }
                if let Some(member) = self.conn_to_member.remove(&conn_id) {
                    let current = self
                        .members
                        .get(&member)
                        .is_some_and(|link| link.conn_id() == conn_id);
                    if current {
                        self.members.remove(&member);
                        info!("{} left the relay ({} registered)", member, self.members.len());
                    }
                }
            }
        }
    }

    fn register(&mut self, conn_id: u64, data: &[u8]) {
        let Some(link) = self.pending.remove(&conn_id) else {
            return;
        };
        let Some(handshake) = Handshake::from_json(data) else {
            warn!("Connection {} sent a frame before registering, closing", conn_id);
            link.close();
            return;
        };
        if handshake.should_warn_version() {
            warn!(
                "{} registered with protocol version {}",
                handshake.peer_id, handshake.version
            );
        }

        let member = handshake.peer_id;
        if let Some(old) = self.members.insert(member, link) {
            debug!("{} re-registered, dropping connection {}", member, old.conn_id());
            self.conn_to_member.remove(&old.conn_id());
        }
        self.conn_to_member.insert(conn_id, member);
        info!("{} registered with the relay ({} registered)", member, self.members.len());
    }

    fn forward(&mut self, member: CollaboratorId, data: &[u8]) {
        let Ok(text) = std::str::from_utf8(data) else {
            warn!("Dropping non-UTF-8 frame from {}", member);
            return;
        };
        let msg = match SignalMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed envelope from {}: {}", member, e);
                return;
            }
        };
        if msg.from != member {
            warn!("Dropping envelope from {} claiming to be {}", member, msg.from);
            return;
        }

        match msg.to {
            Some(to) => match self.members.get(&to) {
                Some(link) => {
                    if let Err(e) = link.send_text(text.to_string()) {
                        debug!("Failed to forward {:?} to {}: {}", msg.kind(), to, e);
                    }
                }
                None => debug!("Dropping {:?} for unregistered {}", msg.kind(), to),
            },
            None => {
                for (id, link) in &self.members {
                    if *id == member {
                        continue;
                    }
                    if let Err(e) = link.send_text(text.to_string()) {
                        debug!("Failed to relay {:?} to {}: {}", msg.kind(), id, e);
                    }
                }
            }
        }
    }
}
