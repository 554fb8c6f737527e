//! End-to-end tests for board-peer.
//!
//! Everything here binds real localhost sockets: the relay, the direct
//! transport, and two full peer hosts collaborating through both.

use std::net::SocketAddr;
use std::time::Duration;

use board_core::protocol::Handshake;
use board_core::signaling::{LeaveAnnounce, SignalPayload};
use board_core::transport::{ConnectivityCandidate, PeerTransport};
use board_core::{
    BoardId, CollaboratorId, SessionConfig, SessionError, SignalMessage, StoreError, TileContent,
    TilePatch, TransportEvent,
};
use board_peer::{BoardTarget, DirectTransport, PeerHost, PeerOptions, Relay};
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

fn alice() -> CollaboratorId {
    CollaboratorId::from(0xa)
}

fn bob() -> CollaboratorId {
    CollaboratorId::from(0xb)
}

fn carol() -> CollaboratorId {
    CollaboratorId::from(0xc)
}

async fn start_relay() -> SocketAddr {
    let relay = Relay::bind("127.0.0.1:0").await.unwrap();
    let addr = relay.local_addr().unwrap();
    tokio::spawn(relay.run());
    addr
}

// ============================================================================
// Relay
// ============================================================================

/// Raw WebSocket client speaking the relay protocol.
struct RelayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: CollaboratorId,
}

impl RelayClient {
    async fn register(addr: SocketAddr, id: CollaboratorId) -> Self {
        let (mut ws, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("Failed to connect");
        ws.send(Message::Binary(Handshake::new(id, "relay").to_json().into()))
            .await
            .unwrap();
        Self { ws, id }
    }

    async fn send(&mut self, msg: &SignalMessage) {
        self.ws.send(Message::Text(msg.to_json().into())).await.unwrap();
    }

    fn leave(&self, from: CollaboratorId) -> SignalMessage {
        SignalMessage::broadcast(
            from,
            SignalPayload::Leave(LeaveAnnounce {
                board_id: BoardId::new(),
            }),
        )
    }

    /// Next envelope, or None if nothing arrives shortly.
    async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            let frame = timeout(Duration::from_millis(300), self.ws.next()).await.ok()??;
            match frame.ok()? {
                Message::Text(text) => return Some(SignalMessage::from_json(&text).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }
}

/// Give the relay time to process registrations.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_relay_broadcasts_to_everyone_else() {
    let addr = start_relay().await;
    let mut a = RelayClient::register(addr, alice()).await;
    let mut b = RelayClient::register(addr, bob()).await;
    let mut c = RelayClient::register(addr, carol()).await;
    settle().await;

    let msg = a.leave(a.id);
    a.send(&msg).await;

    assert_eq!(b.recv().await, Some(msg.clone()));
    assert_eq!(c.recv().await, Some(msg));
    assert_eq!(a.recv().await, None);
}

#[tokio::test]
async fn test_relay_forwards_directed_only_to_target() {
    let addr = start_relay().await;
    let mut a = RelayClient::register(addr, alice()).await;
    let mut b = RelayClient::register(addr, bob()).await;
    let mut c = RelayClient::register(addr, carol()).await;
    settle().await;

    let mut msg = a.leave(a.id);
    msg.to = Some(carol());
    a.send(&msg).await;

    assert_eq!(c.recv().await, Some(msg));
    assert_eq!(b.recv().await, None);
}

#[tokio::test]
async fn test_relay_drops_spoofed_sender() {
    let addr = start_relay().await;
    let mut a = RelayClient::register(addr, alice()).await;
    let mut b = RelayClient::register(addr, bob()).await;
    settle().await;

    let spoofed = a.leave(carol());
    a.send(&spoofed).await;
    assert_eq!(b.recv().await, None);

    // The connection is still usable afterwards
    let honest = a.leave(a.id);
    a.send(&honest).await;
    assert_eq!(b.recv().await, Some(honest));
}

#[tokio::test]
async fn test_relay_closes_unregistered_connection() {
    let addr = start_relay().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws.send(Message::Text("{\"type\":\"leave\"}".into())).await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed);
}

// ============================================================================
// Direct transport
// ============================================================================

async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("transport event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

fn candidate_of(event: TransportEvent) -> ConnectivityCandidate {
    match event {
        TransportEvent::LocalCandidate { candidate, .. } => candidate,
        other => panic!("expected candidate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_direct_link_negotiates_and_carries_frames() {
    let (mut a, mut a_events) = DirectTransport::bind("127.0.0.1:0", None, alice()).await.unwrap();
    let (mut b, mut b_events) = DirectTransport::bind("127.0.0.1:0", None, bob()).await.unwrap();

    let offer = a.create_offer(bob()).unwrap();
    let a_candidate = candidate_of(
        next_matching(&mut a_events, |e| matches!(e, TransportEvent::LocalCandidate { .. })).await,
    );
    let answer = b.create_answer(alice(), &offer).unwrap();
    let b_candidate = candidate_of(
        next_matching(&mut b_events, |e| matches!(e, TransportEvent::LocalCandidate { .. })).await,
    );

    // Candidate before answer: readiness waits for both
    a.add_candidate(bob(), &b_candidate).unwrap();
    a.apply_answer(bob(), &answer).unwrap();
    b.add_candidate(alice(), &a_candidate).unwrap();

    next_matching(&mut a_events, |e| matches!(e, TransportEvent::Ready { .. })).await;
    a.open_channel(bob()).unwrap();

    next_matching(&mut a_events, |e| *e == TransportEvent::ChannelOpen { peer: bob() }).await;
    next_matching(&mut b_events, |e| *e == TransportEvent::ChannelOpen { peer: alice() }).await;

    a.send(bob(), b"hello").unwrap();
    let event = next_matching(&mut b_events, |e| matches!(e, TransportEvent::Message { .. })).await;
    assert_eq!(
        event,
        TransportEvent::Message {
            peer: alice(),
            data: b"hello".to_vec()
        }
    );

    b.send(alice(), b"hi back").unwrap();
    let event = next_matching(&mut a_events, |e| matches!(e, TransportEvent::Message { .. })).await;
    assert_eq!(
        event,
        TransportEvent::Message {
            peer: bob(),
            data: b"hi back".to_vec()
        }
    );

    a.close(bob());
    next_matching(&mut b_events, |e| *e == TransportEvent::ChannelClosed { peer: alice() }).await;
    assert!(a.send(bob(), b"gone").is_err());
}

#[tokio::test]
async fn test_direct_link_rejects_unknown_nonce() {
    let (transport, _events) = DirectTransport::bind("127.0.0.1:0", None, bob()).await.unwrap();
    let (mut ws, _) = connect_async(transport.advertised_url()).await.unwrap();
    ws.send(Message::Binary(Handshake::new(alice(), "bogus").to_json().into()))
        .await
        .unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(Message::Binary(_))) => return false,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed);
}

// ============================================================================
// Two peers through the relay
// ============================================================================

async fn start_peer(
    relay: SocketAddr,
    id: CollaboratorId,
    name: &str,
    target: BoardTarget,
    data_dir: &TempDir,
) -> PeerHost {
    PeerHost::start(PeerOptions {
        signaling_url: format!("ws://{relay}"),
        listen: "127.0.0.1:0".to_string(),
        advertise: None,
        display_name: name.to_string(),
        target,
        data_dir: data_dir.path().to_path_buf(),
        config: SessionConfig::default(),
        peer_id: Some(id),
    })
    .await
    .unwrap()
}

/// Step both hosts until `done` holds.
async fn drive(a: &mut PeerHost, b: &mut PeerHost, done: impl Fn(&PeerHost, &PeerHost) -> bool) {
    timeout(Duration::from_secs(10), async {
        while !done(&*a, &*b) {
            tokio::select! {
                _ = a.step() => {}
                _ = b.step() => {}
            }
        }
    })
    .await
    .expect("hosts did not reach the expected state");
}

fn text_of(host: &PeerHost) -> Option<String> {
    host.board()?.tiles.first().map(|t| t.content.text.clone())
}

fn version_of(host: &PeerHost) -> u64 {
    host.board().map(|b| b.version).unwrap_or(0)
}

#[tokio::test]
async fn test_two_peers_collaborate_through_relay() {
    let relay = start_relay().await;
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let mut a = start_peer(
        relay,
        alice(),
        "alice",
        BoardTarget::Create {
            name: "Session Board".into(),
            description: None,
        },
        &dir_a,
    )
    .await;
    let board_id = a.board().unwrap().id;
    let tile = a
        .session_mut()
        .add_tile(TileContent::text("Hello"))
        .unwrap();
    settle().await;

    let mut b = start_peer(relay, bob(), "bob", BoardTarget::Join(board_id), &dir_b).await;

    // Bob adopts alice's snapshot
    drive(&mut a, &mut b, |_, b| {
        version_of(b) == 1 && text_of(b).as_deref() == Some("Hello")
    })
    .await;
    assert_eq!(b.board().unwrap().name, "Session Board");

    // Bob takes the lock; alice is refused
    assert!(b.session_mut().lock_tile(tile.id).unwrap());
    drive(&mut a, &mut b, |a, _| {
        a.board()
            .and_then(|board| board.tile(&tile.id))
            .and_then(|t| t.lock.holder())
            == Some(bob())
    })
    .await;
    let refused = a.session_mut().edit_tile(tile.id, TilePatch::text("Hi"));
    assert!(matches!(
        refused,
        Err(SessionError::Store(StoreError::LockConflict { .. }))
    ));
    assert_eq!(text_of(&a).as_deref(), Some("Hello"));

    // Bob edits and releases; both converge
    b.session_mut()
        .edit_tile(tile.id, TilePatch::text("Hi there"))
        .unwrap();
    assert!(b.session_mut().unlock_tile(tile.id).unwrap());
    drive(&mut a, &mut b, |a, b| {
        let unlocked = a
            .board()
            .and_then(|board| board.tile(&tile.id))
            .map(|t| t.lock.holder().is_none())
            .unwrap_or(false);
        unlocked && text_of(a).as_deref() == Some("Hi there") && version_of(b) == 2
    })
    .await;
    assert_eq!(version_of(&a), 2);

    a.shutdown().await;
    b.shutdown().await;

    // Alice's copy was saved on the way out
    let saved = std::fs::read_to_string(dir_a.path().join("boards").join(format!("{board_id}.json")))
        .unwrap();
    assert!(saved.contains("Hi there"));
}
