//! WebSocket client for the rendezvous relay.
//!
//! A spawned task owns the socket. It registers with the relay, forwards
//! incoming envelopes to the host, and writes whatever the host queues with
//! [`SignalingClient::send`]. When the socket drops it reconnects with
//! exponential backoff; envelopes queued while disconnected are dropped.

use board_core::clock::{Clock, SystemClock};
use board_core::protocol::{Handshake, MAX_MESSAGE_SIZE};
use board_core::signaling::{ReconnectConfig, ReconnectState};
use board_core::{CollaboratorId, SignalMessage};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Nonce used when registering with the relay.
pub const RELAY_NONCE: &str = "relay";

#[derive(Debug)]
pub enum SignalingEvent {
    /// Registered with the relay (first time or after a drop)
    Connected,
    Disconnected,
    Message(SignalMessage),
}

pub struct SignalingClient {
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Start the client task. Events arrive on the returned receiver.
    pub fn spawn(
        url: String,
        local: CollaboratorId,
        config: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(url, local, config, outgoing_rx, event_tx));
        (Self { outgoing, task }, event_rx)
    }

    /// Queue an envelope. Fire-and-forget.
    pub fn send(&self, msg: SignalMessage) {
        if self.outgoing.send(msg).is_err() {
            debug!("Signaling task has stopped, dropping envelope");
        }
    }

    /// Flush queued envelopes and stop.
    pub async fn close(self) {
        drop(self.outgoing);
        if tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .is_err()
        {
            debug!("Signaling task did not stop in time");
        }
    }
}

enum Exit {
    /// The host dropped its sender
    Shutdown,
    Dropped,
}

async fn run(
    url: String,
    local: CollaboratorId,
    config: ReconnectConfig,
    mut outgoing: mpsc::UnboundedReceiver<SignalMessage>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    let clock = SystemClock;
    let mut reconnect = ReconnectState::new();

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Connected to signaling relay at {}", url);
                reconnect.reset();
                match session(ws, local, &mut outgoing, &events).await {
                    Exit::Shutdown => return,
                    Exit::Dropped => {
                        warn!("Signaling connection to {} dropped", url);
                        if events.send(SignalingEvent::Disconnected).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to reach signaling relay at {}: {}", url, e),
        }

        if reconnect.exceeded_max_attempts(&config) {
            warn!("Giving up on signaling relay after {} attempts", reconnect.attempts);
            return;
        }
        let delay = reconnect.schedule_reconnect(clock.now_ms(), &config);
        info!(
            "Reconnecting to signaling relay in {:?} (attempt {})",
            delay, reconnect.attempts
        );

        // Envelopes queued while we are down are not replayed
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                msg = outgoing.recv() => match msg {
                    Some(msg) => debug!("Dropping {:?} envelope while disconnected", msg.kind()),
                    None => return,
                },
            }
        }
    }
}

async fn session<S>(
    ws: S,
    local: CollaboratorId,
    outgoing: &mut mpsc::UnboundedReceiver<SignalMessage>,
    events: &mpsc::UnboundedSender<SignalingEvent>,
) -> Exit
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws.split();

    let register = Handshake::new(local, RELAY_NONCE);
    if let Err(e) = write.send(Message::Binary(register.to_json().into())).await {
        warn!("Failed to register with relay: {}", e);
        return Exit::Dropped;
    }
    if events.send(SignalingEvent::Connected).is_err() {
        return Exit::Shutdown;
    }

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                };
                if let Err(e) = write.send(Message::Text(msg.to_json().into())).await {
                    warn!("Failed to send {:?} envelope: {}", msg.kind(), e);
                    return Exit::Dropped;
                }
            }
            frame = read.next() => {
                let data = match frame {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non-UTF-8 frame from relay");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return Exit::Dropped,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Relay read error: {}", e);
                        return Exit::Dropped;
                    }
                };
                if data.len() > MAX_MESSAGE_SIZE {
                    warn!("Dropping oversized envelope ({} bytes)", data.len());
                    continue;
                }
                match SignalMessage::from_json(&data) {
                    Ok(msg) => {
                        if events.send(SignalingEvent::Message(msg)).is_err() {
                            return Exit::Shutdown;
                        }
                    }
                    Err(e) => warn!("Dropping malformed envelope: {}", e),
                }
            }
        }
    }
}
