//! Direct WebSocket links between peers.
//!
//! Every peer listens on its own address and advertises it as its only
//! connectivity candidate. Offers and answers carry a random nonce. Once the
//! offerer knows the answer and the answerer's address it dials, sends a
//! [`Handshake`] with the offer nonce, and waits for the echo. The acceptor
//! only takes connections whose nonce matches an offer it answered.
//!
//! The trait methods never block: dialing and accepting happen on spawned
//! tasks and progress is reported on the event channel handed out by
//! [`DirectTransport::bind`].

use crate::link::{LinkEvent, WsLink};
use anyhow::{Context, Result as AnyResult};
use board_core::CollaboratorId;
use board_core::protocol::{Handshake, MAX_MESSAGE_SIZE};
use board_core::transport::{
    ConnectivityCandidate, PeerTransport, Result, SessionDescription, TransportError,
    TransportEvent,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, info, warn};

/// How long either side waits for the other's handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of an offer or answer.
#[derive(Debug, Serialize, Deserialize)]
struct LinkDescription {
    nonce: String,
}

impl LinkDescription {
    fn fresh() -> Self {
        Self {
            nonce: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    fn to_description(&self) -> SessionDescription {
        SessionDescription::new(
            serde_json::to_string(self).expect("LinkDescription serialization should not fail"),
        )
    }

    fn parse(desc: &SessionDescription) -> Result<Self> {
        serde_json::from_str(&desc.sdp)
            .map_err(|_| TransportError::InvalidDescription(desc.sdp.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Offerer,
    Answerer,
}

struct DirectLink {
    side: Side,
    /// Nonce in our own offer or answer
    local_nonce: String,
    remote_nonce: Option<String>,
    remote_url: Option<String>,
    ready_sent: bool,
    dialing: bool,
    channel: Option<WsLink>,
}

impl DirectLink {
    fn new(side: Side, local_nonce: String) -> Self {
        Self {
            side,
            local_nonce,
            remote_nonce: None,
            remote_url: None,
            ready_sent: false,
            dialing: false,
            channel: None,
        }
    }

    /// Nonce both handshakes carry: the one from the offer.
    fn offer_nonce(&self) -> Option<&str> {
        match self.side {
            Side::Offerer => Some(&self.local_nonce),
            Side::Answerer => self.remote_nonce.as_deref(),
        }
    }

    fn is_ready(&self) -> bool {
        self.remote_nonce.is_some() && self.remote_url.is_some()
    }
}

#[derive(Default)]
struct LinkTable {
    links: HashMap<CollaboratorId, DirectLink>,
    /// Open channel conn_id -> peer
    channels: HashMap<u64, CollaboratorId>,
}

struct Shared {
    local: CollaboratorId,
    table: Mutex<LinkTable>,
    events: mpsc::UnboundedSender<TransportEvent>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    next_conn_id: AtomicU64,
}

impl Shared {
    fn with_table<R>(&self, f: impl FnOnce(&mut LinkTable) -> R) -> R {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut table)
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }

    /// Attach an open WebSocket to `peer`'s link if the link is still the
    /// one identified by `local_nonce`.
    fn attach<S>(&self, peer: CollaboratorId, local_nonce: &str, ws: WebSocketStream<S>) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.with_table(|table| {
            let Some(link) = table.links.get_mut(&peer) else {
                return false;
            };
            if link.local_nonce != local_nonce || link.channel.is_some() {
                return false;
            }
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
            // ChannelOpen must reach the host before any frame does
            self.emit(TransportEvent::ChannelOpen { peer });
            link.dialing = false;
            link.channel = Some(WsLink::spawn(conn_id, ws, self.link_events.clone()));
            table.channels.insert(conn_id, peer);
            true
        })
    }

    fn fail(&self, peer: CollaboratorId, local_nonce: &str, reason: String) {
        let current = self.with_table(|table| {
            table
                .links
                .get_mut(&peer)
                .filter(|link| link.local_nonce == local_nonce)
                .map(|link| link.dialing = false)
                .is_some()
        });
        if current {
            self.emit(TransportEvent::Failed { peer, reason });
        }
    }

    fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Frame { conn_id, data } => {
                let peer = self.with_table(|table| table.channels.get(&conn_id).copied());
                match peer {
                    Some(peer) => self.emit(TransportEvent::Message { peer, data }),
                    None => debug!("Dropping frame from stale link {}", conn_id),
                }
            }
            LinkEvent::Closed { conn_id } => {
                let peer = self.with_table(|table| {
                    let peer = table.channels.remove(&conn_id)?;
                    let link = table.links.get_mut(&peer)?;
                    match &link.channel {
                        Some(channel) if channel.conn_id() == conn_id => {
                            link.channel = None;
                            Some(peer)
                        }
                        _ => None,
                    }
                });
                if let Some(peer) = peer {
                    info!("Direct link to {} closed", peer);
                    self.emit(TransportEvent::ChannelClosed { peer });
                }
            }
        }
    }
}

pub struct DirectTransport {
    shared: Arc<Shared>,
    advertise: String,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl DirectTransport {
    /// Listen for peer links on `listen_addr`.
    ///
    /// `advertise` is the URL peers dial; it defaults to `ws://<bound addr>`.
    pub async fn bind(
        listen_addr: &str,
        advertise: Option<String>,
        local: CollaboratorId,
    ) -> AnyResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind peer listener to {listen_addr}"))?;
        let local_addr = listener.local_addr()?;
        let advertise = advertise.unwrap_or_else(|| format!("ws://{local_addr}"));
        info!("Accepting peer links on {} (advertised as {})", local_addr, advertise);

        let (events, events_rx) = mpsc::unbounded_channel();
        let (link_events, mut link_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local,
            table: Mutex::new(LinkTable::default()),
            events,
            link_events,
            next_conn_id: AtomicU64::new(1),
        });

        let pump_shared = Arc::clone(&shared);
        let pump = tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                pump_shared.on_link_event(event);
            }
        });

        let accept_shared = Arc::clone(&shared);
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tokio::spawn(accept_link(Arc::clone(&accept_shared), stream, addr));
                    }
                    Err(e) => {
                        warn!("Peer listener accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok((
            Self {
                shared,
                advertise,
                local_addr,
                tasks: vec![pump, acceptor],
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertised_url(&self) -> &str {
        &self.advertise
    }

    fn start_link(&mut self, peer: CollaboratorId, link: DirectLink) {
        self.shared.with_table(|table| {
            if let Some(old) = table.links.insert(peer, link) {
                if let Some(channel) = old.channel {
                    table.channels.remove(&channel.conn_id());
                }
            }
        });
        self.shared.emit(TransportEvent::LocalCandidate {
            peer,
            candidate: ConnectivityCandidate::new(self.advertise.clone()),
        });
    }

    fn maybe_ready(&self, peer: CollaboratorId) {
        let ready = self.shared.with_table(|table| match table.links.get_mut(&peer) {
            Some(link) if link.is_ready() && !link.ready_sent => {
                link.ready_sent = true;
                true
            }
            _ => false,
        });
        if ready {
            self.shared.emit(TransportEvent::Ready { peer });
        }
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl PeerTransport for DirectTransport {
    fn create_offer(&mut self, peer: CollaboratorId) -> Result<SessionDescription> {
        let desc = LinkDescription::fresh();
        self.start_link(peer, DirectLink::new(Side::Offerer, desc.nonce.clone()));
        Ok(desc.to_description())
    }

    fn create_answer(
        &mut self,
        peer: CollaboratorId,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        let offer = LinkDescription::parse(offer)?;
        let desc = LinkDescription::fresh();
        let mut link = DirectLink::new(Side::Answerer, desc.nonce.clone());
        link.remote_nonce = Some(offer.nonce);
        self.start_link(peer, link);
        Ok(desc.to_description())
    }

    fn apply_answer(&mut self, peer: CollaboratorId, answer: &SessionDescription) -> Result<()> {
        let answer = LinkDescription::parse(answer)?;
        self.shared.with_table(|table| {
            let link = table
                .links
                .get_mut(&peer)
                .ok_or(TransportError::PeerNotFound(peer))?;
            link.remote_nonce = Some(answer.nonce);
            Ok(())
        })?;
        self.maybe_ready(peer);
        Ok(())
    }

    fn add_candidate(
        &mut self,
        peer: CollaboratorId,
        candidate: &ConnectivityCandidate,
    ) -> Result<()> {
        if !candidate.candidate.starts_with("ws://") && !candidate.candidate.starts_with("wss://") {
            return Err(TransportError::ConnectionFailed(format!(
                "unsupported candidate {}",
                candidate.candidate
            )));
        }
        self.shared.with_table(|table| {
            let link = table
                .links
                .get_mut(&peer)
                .ok_or(TransportError::PeerNotFound(peer))?;
            link.remote_url = Some(candidate.candidate.clone());
            Ok(())
        })?;
        self.maybe_ready(peer);
        Ok(())
    }

    fn open_channel(&mut self, peer: CollaboratorId) -> Result<()> {
        let (url, nonce) = self.shared.with_table(|table| {
            let link = table
                .links
                .get_mut(&peer)
                .ok_or(TransportError::PeerNotFound(peer))?;
            let url = link.remote_url.clone().filter(|_| link.is_ready()).ok_or_else(|| {
                TransportError::ConnectionFailed(format!("link to {peer} is not ready"))
            })?;
            if link.side != Side::Offerer {
                return Err(TransportError::Other(format!(
                    "only the offering side dials {peer}"
                )));
            }
            if link.dialing || link.channel.is_some() {
                return Err(TransportError::Other(format!("link to {peer} already open")));
            }
            link.dialing = true;
            Ok((url, link.local_nonce.clone()))
        })?;

        tokio::spawn(dial_link(Arc::clone(&self.shared), peer, url, nonce));
        Ok(())
    }

    fn send(&mut self, peer: CollaboratorId, data: &[u8]) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::SendFailed(format!(
                "{} bytes exceeds max frame size",
                data.len()
            )));
        }
        self.shared.with_table(|table| {
            let channel = table
                .links
                .get(&peer)
                .and_then(|link| link.channel.as_ref())
                .ok_or_else(|| TransportError::SendFailed(format!("no open channel to {peer}")))?;
            channel
                .send(data.to_vec())
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
    }

    fn close(&mut self, peer: CollaboratorId) {
        self.shared.with_table(|table| {
            if let Some(link) = table.links.remove(&peer) {
                if let Some(channel) = link.channel {
                    debug!("Closing direct link to {}", peer);
                    table.channels.remove(&channel.conn_id());
                }
            }
        });
    }
}

/// Offerer side: dial, send our handshake, wait for the echo.
async fn dial_link(shared: Arc<Shared>, peer: CollaboratorId, url: String, nonce: String) {
    let result = async {
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to dial {url}"))?;
        ws.send(Message::Binary(Handshake::new(shared.local, nonce.as_str()).to_json().into()))
            .await
            .context("Failed to send handshake")?;
        let echo = read_handshake(&mut ws).await?;
        if echo.peer_id != peer || echo.nonce != nonce {
            anyhow::bail!("Handshake echo from {} did not match", echo.peer_id);
        }
        Ok::<_, anyhow::Error>(ws)
    }
    .await;

    match result {
        Ok(ws) => {
            if shared.attach(peer, &nonce, ws) {
                info!("Direct link to {} open (dialed {})", peer, url);
            } else {
                debug!("Dialed link to {} is no longer wanted", peer);
            }
        }
        Err(e) => {
            warn!("Direct link to {} failed: {:#}", peer, e);
            shared.fail(peer, &nonce, format!("{e:#}"));
        }
    }
}

/// Acceptor side: check the handshake against an answered offer and echo.
async fn accept_link(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Peer connection from {} did not upgrade: {}", addr, e);
            return;
        }
    };
    let handshake = match read_handshake(&mut ws).await {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!("Dropping peer connection from {}: {:#}", addr, e);
            return;
        }
    };
    let peer = handshake.peer_id;

    let local_nonce = shared.with_table(|table| {
        table
            .links
            .get(&peer)
            .filter(|link| link.side == Side::Answerer && link.channel.is_none())
            .filter(|link| link.offer_nonce() == Some(handshake.nonce.as_str()))
            .map(|link| link.local_nonce.clone())
    });
    let Some(local_nonce) = local_nonce else {
        warn!("Rejecting link from {} at {}: no matching offer", peer, addr);
        let _ = ws.close(None).await;
        return;
    };

    let echo = Handshake::new(shared.local, handshake.nonce.as_str());
    if let Err(e) = ws.send(Message::Binary(echo.to_json().into())).await {
        warn!("Failed to echo handshake to {}: {}", peer, e);
        shared.fail(peer, &local_nonce, e.to_string());
        return;
    }
    if shared.attach(peer, &local_nonce, ws) {
        info!("Direct link from {} open ({})", peer, addr);
    }
}

async fn read_handshake<S>(ws: &mut WebSocketStream<S>) -> AnyResult<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .context("Timed out waiting for handshake")?;
    let data = match frame {
        Some(Ok(Message::Binary(data))) => data.to_vec(),
        Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
        Some(Ok(other)) => anyhow::bail!("Expected handshake, got {:?}", other),
        Some(Err(e)) => return Err(e).context("Link failed during handshake"),
        None => anyhow::bail!("Link closed during handshake"),
    };
    let handshake = Handshake::from_json(&data).context("First frame was not a handshake")?;
    if handshake.should_warn_version() {
        warn!(
            "{} speaks protocol version {}",
            handshake.peer_id, handshake.version
        );
    }
    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> CollaboratorId {
        CollaboratorId::from(0xa)
    }

    fn bob() -> CollaboratorId {
        CollaboratorId::from(0xb)
    }

    #[test]
    fn test_description_carries_nonce() {
        let desc = LinkDescription::fresh();
        let parsed = LinkDescription::parse(&desc.to_description()).unwrap();
        assert_eq!(parsed.nonce, desc.nonce);
        assert_eq!(parsed.nonce.len(), 32);
    }

    #[test]
    fn test_garbage_description_is_invalid() {
        let result = LinkDescription::parse(&SessionDescription::new("offer:abc"));
        assert!(matches!(result, Err(TransportError::InvalidDescription(_))));
    }

    #[tokio::test]
    async fn test_offer_emits_advertised_candidate() {
        let (mut transport, mut events) =
            DirectTransport::bind("127.0.0.1:0", None, alice()).await.unwrap();
        transport.create_offer(bob()).unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::LocalCandidate { peer, candidate } => {
                assert_eq!(peer, bob());
                assert_eq!(candidate.candidate, format!("ws://{}", transport.local_addr()));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_before_ready_fails() {
        let (mut transport, _events) =
            DirectTransport::bind("127.0.0.1:0", None, alice()).await.unwrap();
        transport.create_offer(bob()).unwrap();
        assert!(transport.open_channel(bob()).is_err());
        assert!(matches!(
            transport.open_channel(CollaboratorId::from(0xc)),
            Err(TransportError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_channel_fails() {
        let (mut transport, _events) =
            DirectTransport::bind("127.0.0.1:0", None, alice()).await.unwrap();
        assert!(matches!(
            transport.send(bob(), b"hi"),
            Err(TransportError::SendFailed(_))
        ));
        // Closing an unknown peer is a no-op
        transport.close(bob());
    }
}
