//! board-peer: tokio host for board-core.
//!
//! Provides the rendezvous relay, the signaling client, the direct WebSocket
//! peer transport, JSON-file persistence and a line-command console, plus
//! [`PeerHost`] to run a session with all of them.

pub mod command;
pub mod direct;
pub mod file_store;
pub mod host;
pub mod link;
pub mod relay;
pub mod signaling;

pub use command::{Command, CommandError};
pub use direct::DirectTransport;
pub use file_store::JsonBoardStore;
pub use host::{BoardTarget, HostSession, PeerHost, PeerOptions};
pub use relay::Relay;
pub use signaling::{SignalingClient, SignalingEvent};
