//! Signaling envelope and reconnection backoff.
//!
//! Signaling is the rendezvous channel peers use before they have a direct
//! link: join/leave announcements, offer/answer exchange, connectivity
//! candidates and a generic relay for out-of-band notices.
//!
//! Wire format: `{"type":"offer","from":"..","to":"..","payload":{..}}`.
//! An absent `to` means broadcast. `payload` is validated against `type` on
//! the way in.

use crate::ids::{BoardId, CollaboratorId};
use crate::model::Role;
use crate::transport::{ConnectivityCandidate, SessionDescription};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Join,
    Leave,
    Offer,
    Answer,
    Candidate,
    Relay,
}

/// What a collaborator tells others about itself when announcing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorProfile {
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAnnounce {
    pub board_id: BoardId,
    pub profile: CollaboratorProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveAnnounce {
    pub board_id: BoardId,
}

/// Out-of-band notices carried by `relay` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayPayload {
    #[serde(rename_all = "camelCase")]
    JoinRejected { board_id: BoardId, reason: String },
    #[serde(rename_all = "camelCase")]
    Invite { board_id: BoardId, role: Role },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Join(JoinAnnounce),
    Leave(LeaveAnnounce),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(ConnectivityCandidate),
    Relay(RelayPayload),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Join(_) => SignalKind::Join,
            SignalPayload::Leave(_) => SignalKind::Leave,
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::Candidate(_) => SignalKind::Candidate,
            SignalPayload::Relay(_) => SignalKind::Relay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireSignal")]
pub struct SignalMessage {
    pub from: CollaboratorId,
    /// None = broadcast to everyone in the room
    pub to: Option<CollaboratorId>,
    pub payload: SignalPayload,
}

impl SignalMessage {
    pub fn broadcast(from: CollaboratorId, payload: SignalPayload) -> Self {
        Self {
            from,
            to: None,
            payload,
        }
    }

    pub fn directed(from: CollaboratorId, to: CollaboratorId, payload: SignalPayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Serialize to a JSON string (signaling travels as text frames).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("SignalMessage serialization should not fail")
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl Serialize for SignalMessage {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let len = if self.to.is_some() { 4 } else { 3 };
        let mut st = s.serialize_struct("SignalMessage", len)?;
        st.serialize_field("type", &self.kind())?;
        st.serialize_field("from", &self.from)?;
        if let Some(to) = &self.to {
            st.serialize_field("to", to)?;
        }
        match &self.payload {
            SignalPayload::Join(join) => st.serialize_field("payload", join)?,
            SignalPayload::Leave(leave) => st.serialize_field("payload", leave)?,
            SignalPayload::Offer(sdp) | SignalPayload::Answer(sdp) => {
                st.serialize_field("payload", sdp)?
            }
            SignalPayload::Candidate(candidate) => st.serialize_field("payload", candidate)?,
            SignalPayload::Relay(relay) => st.serialize_field("payload", relay)?,
        }
        st.end()
    }
}

#[derive(Deserialize)]
struct WireSignal {
    #[serde(rename = "type")]
    kind: SignalKind,
    from: CollaboratorId,
    #[serde(default)]
    to: Option<CollaboratorId>,
    payload: serde_json::Value,
}

impl TryFrom<WireSignal> for SignalMessage {
    type Error = String;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        fn shape<T: serde::de::DeserializeOwned>(
            kind: SignalKind,
            payload: serde_json::Value,
        ) -> Result<T, String> {
            serde_json::from_value(payload).map_err(|e| format!("invalid {kind:?} payload: {e}"))
        }

        let payload = match wire.kind {
            SignalKind::Join => SignalPayload::Join(shape(wire.kind, wire.payload)?),
            SignalKind::Leave => SignalPayload::Leave(shape(wire.kind, wire.payload)?),
            SignalKind::Offer => SignalPayload::Offer(shape(wire.kind, wire.payload)?),
            SignalKind::Answer => SignalPayload::Answer(shape(wire.kind, wire.payload)?),
            SignalKind::Candidate => SignalPayload::Candidate(shape(wire.kind, wire.payload)?),
            SignalKind::Relay => SignalPayload::Relay(shape(wire.kind, wire.payload)?),
        };

        Ok(SignalMessage {
            from: wire.from,
            to: wire.to,
            payload,
        })
    }
}

// ============================================================================
// Reconnection backoff
// ============================================================================

/// Configuration for signaling reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Delay before attempt number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub attempts: u32,
    /// When to attempt the next reconnection (ms since epoch)
    pub next_attempt_at: Option<u64>,
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the next attempt. Returns the delay chosen.
    pub fn schedule_reconnect(&mut self, now_ms: u64, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        self.next_attempt_at = Some(now_ms + self.current_delay.as_millis() as u64);
        self.current_delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
        self.current_delay = Duration::ZERO;
    }

    pub fn should_reconnect(&self, now_ms: u64) -> bool {
        self.next_attempt_at.map(|t| now_ms >= t).unwrap_or(false)
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}
