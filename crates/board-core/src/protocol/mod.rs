//! Protocol definitions for direct peer links.
//!
//! - Versioned handshake, the first frame on every link
//! - Peer messages exchanged once the link is up

pub mod handshake;
pub mod message;

pub use handshake::{Handshake, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use message::{PeerMessage, ProtocolError};
