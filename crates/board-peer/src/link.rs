//! A single WebSocket link with its own reader and writer tasks.
//!
//! Used by the relay for client connections and by the direct transport for
//! peer links. Frames and the final close are reported on an event channel
//! tagged with the link's `conn_id`, so the owner can tell a stale link's
//! close from the current one.

use board_core::protocol::MAX_MESSAGE_SIZE;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

#[derive(Debug)]
pub enum LinkEvent {
    Frame { conn_id: u64, data: Vec<u8> },
    Closed { conn_id: u64 },
}

#[derive(Debug, thiserror::Error)]
#[error("link {0} is closed")]
pub struct LinkClosed(pub u64);

pub struct WsLink {
    conn_id: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl WsLink {
    /// Take over a WebSocket stream whose handshake (if any) is done.
    pub fn spawn<S>(
        conn_id: u64,
        ws: WebSocketStream<S>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut write, read) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Write on link {} failed: {}", conn_id, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(read_loop(conn_id, read, events));

        Self {
            conn_id,
            outgoing,
            reader,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue a binary frame.
    pub fn send(&self, data: Vec<u8>) -> Result<(), LinkClosed> {
        self.outgoing
            .send(Message::Binary(data.into()))
            .map_err(|_| LinkClosed(self.conn_id))
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: String) -> Result<(), LinkClosed> {
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| LinkClosed(self.conn_id))
    }

    /// Send a close frame. The reader reports `Closed` once the peer
    /// finishes the close handshake.
    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        let _ = self.outgoing.send(Message::Close(None));
        self.reader.abort();
    }
}

async fn read_loop<S>(
    conn_id: u64,
    mut read: futures::stream::SplitStream<WebSocketStream<S>>,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data: Vec<u8> = match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.as_bytes().to_vec(),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame on link {}", conn_id);
                        break;
                    }
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Frame on link {} exceeds max size ({} > {}), dropping",
                        conn_id,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }

                if events.send(LinkEvent::Frame { conn_id, data }).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Link {} closed", conn_id);
                    }
                    _ => error!("WebSocket error on link {}: {}", conn_id, e),
                }
                break;
            }
            None => {
                debug!("Link {} stream ended", conn_id);
                break;
            }
        }
    }

    let _ = events.send(LinkEvent::Closed { conn_id });
}
