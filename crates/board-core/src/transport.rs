//! PeerTransport trait for direct peer links.
//!
//! Calls are synchronous and non-blocking: they start work and return.
//! Progress comes back as [`TransportEvent`]s, which the host feeds into the
//! peer connection manager.
//!
//! Implementations:
//! - `MemoryNetwork`: in-process, for tests and simulations
//! - `DirectTransport` (board-peer): WebSocket links between peers

use crate::ids::CollaboratorId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(CollaboratorId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Opaque offer/answer body produced and consumed by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// A way to reach the local end of a link (an address, a relay slot, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityCandidate {
    pub candidate: String,
}

impl ConnectivityCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local candidate to hand to the peer over signaling
    LocalCandidate {
        peer: CollaboratorId,
        candidate: ConnectivityCandidate,
    },
    /// Remote description and candidates applied; a channel can be opened
    Ready { peer: CollaboratorId },
    /// The ordered reliable data channel is open
    ChannelOpen { peer: CollaboratorId },
    Message { peer: CollaboratorId, data: Vec<u8> },
    ChannelClosed { peer: CollaboratorId },
    Failed { peer: CollaboratorId, reason: String },
}

impl TransportEvent {
    pub fn peer(&self) -> CollaboratorId {
        match self {
            TransportEvent::LocalCandidate { peer, .. }
            | TransportEvent::Ready { peer }
            | TransportEvent::ChannelOpen { peer }
            | TransportEvent::Message { peer, .. }
            | TransportEvent::ChannelClosed { peer }
            | TransportEvent::Failed { peer, .. } => *peer,
        }
    }
}

/// Transport layer for direct peer links.
pub trait PeerTransport {
    /// Start a link as the offering side.
    fn create_offer(&mut self, peer: CollaboratorId) -> Result<SessionDescription>;

    /// Start a link as the answering side.
    fn create_answer(
        &mut self,
        peer: CollaboratorId,
        offer: &SessionDescription,
    ) -> Result<SessionDescription>;

    fn apply_answer(&mut self, peer: CollaboratorId, answer: &SessionDescription) -> Result<()>;

    fn add_candidate(&mut self, peer: CollaboratorId, candidate: &ConnectivityCandidate)
    -> Result<()>;

    /// Open the data channel once the link reported `Ready`.
    fn open_channel(&mut self, peer: CollaboratorId) -> Result<()>;

    fn send(&mut self, peer: CollaboratorId, data: &[u8]) -> Result<()>;

    /// Tear the link down. Closing an unknown peer is a no-op.
    fn close(&mut self, peer: CollaboratorId);
}

// ============================================================================
// In-memory network
// ============================================================================

#[derive(Debug, Default)]
struct LinkHalf {
    remote_description: bool,
    remote_candidates: usize,
    ready_sent: bool,
    channel_open: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    queues: HashMap<CollaboratorId, VecDeque<TransportEvent>>,
    /// Keyed by (local, remote)
    links: HashMap<(CollaboratorId, CollaboratorId), LinkHalf>,
    partitioned: HashSet<CollaboratorId>,
}

impl NetworkState {
    fn push(&mut self, node: CollaboratorId, event: TransportEvent) {
        self.queues.entry(node).or_default().push_back(event);
    }

    fn cut(&self, a: &CollaboratorId, b: &CollaboratorId) -> bool {
        self.partitioned.contains(a) || self.partitioned.contains(b)
    }

    fn maybe_ready(&mut self, local: CollaboratorId, peer: CollaboratorId) {
        let ready = match self.links.get_mut(&(local, peer)) {
            Some(half) if half.remote_description && half.remote_candidates > 0 && !half.ready_sent => {
                half.ready_sent = true;
                true
            }
            _ => false,
        };
        if ready {
            self.push(local, TransportEvent::Ready { peer });
        }
    }
}

/// Shared in-process network. Each node gets a [`MemoryTransport`] and an
/// event queue drained with [`MemoryNetwork::next_event`].
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, local: CollaboratorId) -> MemoryTransport {
        MemoryTransport {
            local,
            network: self.clone(),
        }
    }

    pub fn next_event(&self, node: &CollaboratorId) -> Option<TransportEvent> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.queues.get_mut(node).and_then(|q| q.pop_front())
    }

    /// Silently drop all traffic to and from `node`.
    pub fn partition(&self, node: CollaboratorId) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.partitioned.insert(node);
    }

    pub fn heal(&self, node: &CollaboratorId) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.partitioned.remove(node);
    }
}

pub struct MemoryTransport {
    local: CollaboratorId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_id(&self) -> CollaboratorId {
        self.local
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut NetworkState) -> R) -> R {
        let mut state = self
            .network
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn start_link(&self, state: &mut NetworkState, peer: CollaboratorId) {
        state.links.insert((self.local, peer), LinkHalf::default());
        state.push(
            self.local,
            TransportEvent::LocalCandidate {
                peer,
                candidate: ConnectivityCandidate::new(format!("mem:{}", self.local)),
            },
        );
    }
}

impl PeerTransport for MemoryTransport {
    fn create_offer(&mut self, peer: CollaboratorId) -> Result<SessionDescription> {
        self.with_state(|state| self.start_link(state, peer));
        Ok(SessionDescription::new(format!("offer:{}", self.local)))
    }

    fn create_answer(
        &mut self,
        peer: CollaboratorId,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        if !offer.sdp.starts_with("offer:") {
            return Err(TransportError::InvalidDescription(offer.sdp.clone()));
        }
        let local = self.local;
        self.with_state(|state| {
            self.start_link(state, peer);
            if let Some(half) = state.links.get_mut(&(local, peer)) {
                half.remote_description = true;
            }
            state.maybe_ready(local, peer);
        });
        Ok(SessionDescription::new(format!("answer:{}", self.local)))
    }

    fn apply_answer(&mut self, peer: CollaboratorId, answer: &SessionDescription) -> Result<()> {
        if !answer.sdp.starts_with("answer:") {
            return Err(TransportError::InvalidDescription(answer.sdp.clone()));
        }
        let local = self.local;
        self.with_state(|state| {
            let half = state
                .links
                .get_mut(&(local, peer))
                .ok_or(TransportError::PeerNotFound(peer))?;
            half.remote_description = true;
            state.maybe_ready(local, peer);
            Ok(())
        })
    }

    fn add_candidate(
        &mut self,
        peer: CollaboratorId,
        _candidate: &ConnectivityCandidate,
    ) -> Result<()> {
        let local = self.local;
        self.with_state(|state| {
            let half = state
                .links
                .get_mut(&(local, peer))
                .ok_or(TransportError::PeerNotFound(peer))?;
            half.remote_candidates += 1;
            state.maybe_ready(local, peer);
            Ok(())
        })
    }

    fn open_channel(&mut self, peer: CollaboratorId) -> Result<()> {
        let local = self.local;
        self.with_state(|state| {
            let ready = state
                .links
                .get(&(local, peer))
                .map(|h| h.ready_sent)
                .ok_or(TransportError::PeerNotFound(peer))?;
            if !ready {
                return Err(TransportError::ConnectionFailed(format!(
                    "link to {peer} is not ready"
                )));
            }
            if state.cut(&local, &peer) {
                return Ok(());
            }
            let Some(remote) = state.links.get_mut(&(peer, local)) else {
                return Err(TransportError::ConnectionFailed(format!(
                    "{peer} has no link to us"
                )));
            };
            remote.channel_open = true;
            if let Some(half) = state.links.get_mut(&(local, peer)) {
                half.channel_open = true;
            }
            state.push(local, TransportEvent::ChannelOpen { peer });
            state.push(peer, TransportEvent::ChannelOpen { peer: local });
            Ok(())
        })
    }

    fn send(&mut self, peer: CollaboratorId, data: &[u8]) -> Result<()> {
        let local = self.local;
        self.with_state(|state| {
            let open = state
                .links
                .get(&(local, peer))
                .map(|h| h.channel_open)
                .unwrap_or(false);
            if !open {
                return Err(TransportError::SendFailed(format!("no open channel to {peer}")));
            }
            if !state.cut(&local, &peer) {
                state.push(
                    peer,
                    TransportEvent::Message {
                        peer: local,
                        data: data.to_vec(),
                    },
                );
            }
            Ok(())
        })
    }

    fn close(&mut self, peer: CollaboratorId) {
        let local = self.local;
        self.with_state(|state| {
            if state.links.remove(&(local, peer)).is_none() {
                return;
            }
            let notify = match state.links.get_mut(&(peer, local)) {
                Some(remote) if remote.channel_open => {
                    remote.channel_open = false;
                    !state.cut(&local, &peer)
                }
                _ => false,
            };
            if notify {
                state.push(peer, TransportEvent::ChannelClosed { peer: local });
            }
        })
    }
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

    fn drain(net: &MemoryNetwork, node: CollaboratorId) -> Vec<TransportEvent> {
        std::iter::from_fn(|| net.next_event(&node)).collect()
    }

    fn candidate_of(events: &[TransportEvent]) -> ConnectivityCandidate {
        events
            .iter()
            .find_map(|e| match e {
                TransportEvent::LocalCandidate { candidate, .. } => Some(candidate.clone()),
                _ => None,
            })
            .unwrap()
    }

    /// Run a full negotiation between alice (offerer) and bob.
    fn connect(net: &MemoryNetwork) -> (MemoryTransport, MemoryTransport) {
        let mut a = net.transport(alice());
        let mut b = net.transport(bob());

        let offer = a.create_offer(bob()).unwrap();
        let a_candidate = candidate_of(&drain(net, alice()));
        let answer = b.create_answer(alice(), &offer).unwrap();
        let b_candidate = candidate_of(&drain(net, bob()));

        b.add_candidate(alice(), &a_candidate).unwrap();
        a.apply_answer(bob(), &answer).unwrap();
        a.add_candidate(bob(), &b_candidate).unwrap();

        assert!(drain(net, alice()).contains(&TransportEvent::Ready { peer: bob() }));
        a.open_channel(bob()).unwrap();
        (a, b)
    }

    #[test]
    fn test_offer_emits_local_candidate() {
        let net = MemoryNetwork::new();
        let mut a = net.transport(alice());
        a.create_offer(bob()).unwrap();
        let events = drain(&net, alice());
        assert!(matches!(events[0], TransportEvent::LocalCandidate { peer, .. } if peer == bob()));
    }

    #[test]
    fn test_ready_needs_description_and_candidate() {
        let net = MemoryNetwork::new();
        let mut a = net.transport(alice());
        a.create_offer(bob()).unwrap();
        drain(&net, alice());

        a.add_candidate(bob(), &ConnectivityCandidate::new("mem:b")).unwrap();
        assert!(drain(&net, alice()).is_empty());

        a.apply_answer(bob(), &SessionDescription::new("answer:b")).unwrap();
        assert_eq!(drain(&net, alice()), vec![TransportEvent::Ready { peer: bob() }]);
    }

    #[test]
    fn test_channel_open_reaches_both_sides() {
        let net = MemoryNetwork::new();
        let _ = connect(&net);
        assert_eq!(
            drain(&net, alice()),
            vec![TransportEvent::ChannelOpen { peer: bob() }]
        );
        assert!(drain(&net, bob()).contains(&TransportEvent::ChannelOpen { peer: alice() }));
    }

    #[test]
    fn test_send_and_close() {
        let net = MemoryNetwork::new();
        let (mut a, _b) = connect(&net);
        drain(&net, alice());
        drain(&net, bob());

        a.send(bob(), b"hello").unwrap();
        assert_eq!(
            drain(&net, bob()),
            vec![TransportEvent::Message {
                peer: alice(),
                data: b"hello".to_vec()
            }]
        );

        a.close(bob());
        assert_eq!(
            drain(&net, bob()),
            vec![TransportEvent::ChannelClosed { peer: alice() }]
        );
        assert!(a.send(bob(), b"again").is_err());
    }

    #[test]
    fn test_partition_drops_traffic() {
        let net = MemoryNetwork::new();
        let (mut a, _b) = connect(&net);
        drain(&net, bob());

        net.partition(alice());
        a.send(bob(), b"lost").unwrap();
        assert!(drain(&net, bob()).is_empty());

        net.heal(&alice());
        a.send(bob(), b"found").unwrap();
        assert_eq!(drain(&net, bob()).len(), 1);
    }

    #[test]
    fn test_apply_answer_without_offer_fails() {
        let net = MemoryNetwork::new();
        let mut a = net.transport(alice());
        assert!(matches!(
            a.apply_answer(bob(), &SessionDescription::new("answer:b")),
            Err(TransportError::PeerNotFound(_))
        ));
    }
}
