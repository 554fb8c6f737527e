//! Versioned handshake for direct peer links.
//!
//! The dialing side sends a handshake as the first frame on a fresh link; the
//! accepting side checks the nonce it handed out in its offer or answer and
//! echoes its own handshake back. Anything else on a link before the
//! handshake is a protocol violation.

use crate::ids::CollaboratorId;
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single frame on a peer link (16MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    pub version: u32,
    pub peer_id: CollaboratorId,
    /// Nonce from the session description this link belongs to
    pub nonce: String,
}

impl Handshake {
    pub fn new(peer_id: CollaboratorId, nonce: impl Into<String>) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            peer_id,
            nonce: nonce.into(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Handshake serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or if the `type` field isn't `"handshake"`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let handshake: Self = serde_json::from_slice(data).ok()?;
        if handshake.msg_type == "handshake" {
            Some(handshake)
        } else {
            None
        }
    }

    /// Check if we should log a version mismatch warning.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer_id() -> CollaboratorId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    #[test]
    fn test_wire_format() {
        let hs = Handshake::new(test_peer_id(), "n-1");
        let json = String::from_utf8(hs.to_json()).unwrap();

        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"version\":1"));
        assert!(json.contains("\"peerId\":\"a1b2c3d4e5f67890\""));
        assert!(json.contains("\"nonce\":\"n-1\""));
    }

    #[test]
    fn test_parse_back() {
        let hs = Handshake::new(test_peer_id(), "n-1");
        assert_eq!(Handshake::from_json(&hs.to_json()), Some(hs));
    }

    #[test]
    fn test_invalid_json() {
        assert!(Handshake::from_json(b"not json").is_none());
        assert!(Handshake::from_json(b"{}").is_none());
        assert!(Handshake::from_json(b"").is_none());
    }

    #[test]
    fn test_wrong_type() {
        let json = br#"{"type":"change","version":1,"peerId":"a1b2c3d4e5f67890","nonce":"x"}"#;
        assert!(Handshake::from_json(json).is_none());
    }

    #[test]
    fn test_different_version_warns() {
        let json = r#"{"type":"handshake","version":99,"peerId":"a1b2c3d4e5f67890","nonce":"x"}"#;
        let hs = Handshake::from_json(json.as_bytes()).unwrap();
        assert!(hs.should_warn_version());
    }
}
