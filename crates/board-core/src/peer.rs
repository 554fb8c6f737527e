//! Peer connection manager.
//!
//! One [`PeerLink`] per remote collaborator, each moving through
//! `New -> Negotiating -> Connected -> (Closed | Failed)`.
//!
//! The manager is sans-IO like the rest of the core: it drives a
//! [`PeerTransport`], consumes signaling and transport events, and returns
//! [`PeerOutput`]s for the caller to act on (signals to send, link state
//! changes, received data). Time comes in through `now_ms`.
//!
//! Rules:
//! - Candidates are buffered per sender until the link exists and its remote
//!   description has been applied, then flushed in arrival order. At most
//!   `MAX_BUFFERED_CANDIDATES` are kept per sender; a buffer whose sender has
//!   no link after `negotiation_timeout` is dropped.
//! - Glare (both sides offered): the lower collaborator id keeps its offer.
//! - A negotiation that does not connect within `negotiation_timeout` fails,
//!   is retried once after `retry_delay`, then reported unreachable.
//! - A connected link silent for `liveness_timeout` is closed as unreachable.
//! - Sends only reach connected links; anything else is dropped.

use crate::ids::CollaboratorId;
use crate::signaling::{SignalMessage, SignalPayload};
use crate::transport::{
    ConnectivityCandidate, PeerTransport, SessionDescription, TransportError, TransportEvent,
};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Candidates kept per sender while its link cannot take them.
pub const MAX_BUFFERED_CANDIDATES: usize = 32;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Negotiation with {0} timed out")]
    NegotiationTimeout(CollaboratorId),

    #[error("Link to {0} went silent")]
    LivenessTimeout(CollaboratorId),

    #[error("No connected link to {0}")]
    NotConnected(CollaboratorId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Time allowed from offer/answer to an open channel (default: 15s)
    pub negotiation_timeout: Duration,
    /// Delay before the single retry of a failed negotiation (default: 1s)
    pub retry_delay: Duration,
    /// Silence after which a connected link is considered dead (default: 10s)
    pub liveness_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            retry_delay: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone)]
pub struct PeerLink {
    pub state: LinkState,
    pub role: LinkRole,
    /// When the current negotiation started
    pub started_at: u64,
    pub remote_description_applied: bool,
    /// Whether the single retry has been spent
    pub retried: bool,
    /// When the retry fires (Failed links only)
    pub retry_at: Option<u64>,
    /// Last time anything arrived on the channel
    pub last_heard: u64,
}

impl PeerLink {
    fn new(role: LinkRole, now_ms: u64, retried: bool) -> Self {
        Self {
            state: LinkState::New,
            role,
            started_at: now_ms,
            remote_description_applied: false,
            retried,
            retry_at: None,
            last_heard: now_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerOutput {
    /// Send over signaling
    Signal(SignalMessage),
    Connected { peer: CollaboratorId },
    Unreachable {
        peer: CollaboratorId,
        retrying: bool,
        reason: String,
    },
    Closed { peer: CollaboratorId },
    Message { peer: CollaboratorId, data: Vec<u8> },
}

#[derive(Debug)]
struct CandidateBuffer {
    /// When the first candidate arrived
    since: u64,
    candidates: Vec<ConnectivityCandidate>,
}

pub struct PeerConnectionManager<T: PeerTransport> {
    local: CollaboratorId,
    transport: T,
    config: PeerConfig,
    links: HashMap<CollaboratorId, PeerLink>,
    /// Candidates received before their link could take them
    pending_candidates: HashMap<CollaboratorId, CandidateBuffer>,
}

impl<T: PeerTransport> PeerConnectionManager<T> {
    pub fn new(local: CollaboratorId, transport: T, config: PeerConfig) -> Self {
        Self {
            local,
            transport,
            config,
            links: HashMap::new(),
            pending_candidates: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> CollaboratorId {
        self.local
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn link(&self, peer: &CollaboratorId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    pub fn state(&self, peer: &CollaboratorId) -> Option<LinkState> {
        self.links.get(peer).map(|l| l.state)
    }

    /// Connected peers, in id order.
    pub fn connected_peers(&self) -> Vec<CollaboratorId> {
        let mut peers: Vec<CollaboratorId> = self
            .links
            .iter()
            .filter(|(_, l)| l.state == LinkState::Connected)
            .map(|(id, _)| *id)
            .collect();
        peers.sort();
        peers
    }

    pub fn buffered_candidates(&self, peer: &CollaboratorId) -> usize {
        self.pending_candidates
            .get(peer)
            .map(|b| b.candidates.len())
            .unwrap_or(0)
    }

    // ==================== Negotiation ====================

    /// A remote collaborator was announced: offer them a link.
    ///
    /// No-op when a link is already negotiating or connected. A failed link
    /// waiting for its retry starts afresh.
    pub fn connect(&mut self, peer: CollaboratorId, now_ms: u64) -> Vec<PeerOutput> {
        if peer == self.local {
            return Vec::new();
        }
        if let Some(link) = self.links.get(&peer) {
            if matches!(link.state, LinkState::Negotiating | LinkState::Connected) {
                return Vec::new();
            }
        }
        self.offer(peer, now_ms, false)
    }

    fn offer(&mut self, peer: CollaboratorId, now_ms: u64, retried: bool) -> Vec<PeerOutput> {
        let mut link = PeerLink::new(LinkRole::Offerer, now_ms, retried);
        match self.transport.create_offer(peer) {
            Ok(offer) => {
                link.state = LinkState::Negotiating;
                self.links.insert(peer, link);
                info!("Offering link to {}", peer);
                vec![PeerOutput::Signal(SignalMessage::directed(
                    self.local,
                    peer,
                    SignalPayload::Offer(offer),
                ))]
            }
            Err(e) => {
                self.links.insert(peer, link);
                self.fail(peer, ConnectionError::from(e), now_ms)
            }
        }
    }

    pub fn handle_offer(
        &mut self,
        from: CollaboratorId,
        offer: &SessionDescription,
        now_ms: u64,
    ) -> Vec<PeerOutput> {
        if let Some(link) = self.links.get(&from) {
            if link.state == LinkState::Negotiating && link.role == LinkRole::Offerer {
                if self.local < from {
                    debug!("Glare with {}: keeping our offer", from);
                    return Vec::new();
                }
                debug!("Glare with {}: abandoning our offer", from);
            } else {
                debug!("Replacing {:?} link to {} with incoming offer", link.state, from);
            }
            self.transport.close(from);
            self.links.remove(&from);
        }

        let mut link = PeerLink::new(LinkRole::Answerer, now_ms, false);
        match self.transport.create_answer(from, offer) {
            Ok(answer) => {
                link.state = LinkState::Negotiating;
                link.remote_description_applied = true;
                self.links.insert(from, link);
                let mut outputs = vec![PeerOutput::Signal(SignalMessage::directed(
                    self.local,
                    from,
                    SignalPayload::Answer(answer),
                ))];
                outputs.extend(self.flush_candidates(from, now_ms));
                outputs
            }
            Err(e) => {
                self.links.insert(from, link);
                self.fail(from, ConnectionError::from(e), now_ms)
            }
        }
    }

    pub fn handle_answer(
        &mut self,
        from: CollaboratorId,
        answer: &SessionDescription,
        now_ms: u64,
    ) -> Vec<PeerOutput> {
        let expected = matches!(
            self.links.get(&from),
            Some(link) if link.state == LinkState::Negotiating && link.role == LinkRole::Offerer
        );
        if !expected {
            warn!("Ignoring unexpected answer from {}", from);
            return Vec::new();
        }

        if let Err(e) = self.transport.apply_answer(from, answer) {
            return self.fail(from, ConnectionError::from(e), now_ms);
        }
        if let Some(link) = self.links.get_mut(&from) {
            link.remote_description_applied = true;
        }
        self.flush_candidates(from, now_ms)
    }

    pub fn handle_candidate(
        &mut self,
        from: CollaboratorId,
        candidate: ConnectivityCandidate,
        now_ms: u64,
    ) -> Vec<PeerOutput> {
        let ready = matches!(
            self.links.get(&from),
            Some(link) if link.remote_description_applied
                && matches!(link.state, LinkState::Negotiating | LinkState::Connected)
        );
        if !ready {
            let buffer = self
                .pending_candidates
                .entry(from)
                .or_insert_with(|| CandidateBuffer {
                    since: now_ms,
                    candidates: Vec::new(),
                });
            if buffer.candidates.len() >= MAX_BUFFERED_CANDIDATES {
                debug!("Candidate buffer for {} is full, dropping candidate", from);
            } else {
                debug!("Buffering candidate from {}", from);
                buffer.candidates.push(candidate);
            }
            return Vec::new();
        }
        match self.transport.add_candidate(from, &candidate) {
            Ok(()) => Vec::new(),
            Err(e) => self.fail(from, ConnectionError::from(e), now_ms),
        }
    }

    fn flush_candidates(&mut self, peer: CollaboratorId, now_ms: u64) -> Vec<PeerOutput> {
        let Some(CandidateBuffer {
            candidates: buffered,
            ..
        }) = self.pending_candidates.remove(&peer)
        else {
            return Vec::new();
        };
        debug!("Applying {} buffered candidates from {}", buffered.len(), peer);
        for candidate in &buffered {
            if let Err(e) = self.transport.add_candidate(peer, candidate) {
                return self.fail(peer, ConnectionError::from(e), now_ms);
            }
        }
        Vec::new()
    }

    // ==================== Transport events ====================

    pub fn handle_transport_event(&mut self, event: TransportEvent, now_ms: u64) -> Vec<PeerOutput> {
        let peer = event.peer();
        let Some(state) = self.state(&peer) else {
            debug!("Dropping transport event for unknown peer {}", peer);
            return Vec::new();
        };

        match event {
            TransportEvent::LocalCandidate { candidate, .. } => {
                if matches!(state, LinkState::Closed | LinkState::Failed) {
                    return Vec::new();
                }
                vec![PeerOutput::Signal(SignalMessage::directed(
                    self.local,
                    peer,
                    SignalPayload::Candidate(candidate),
                ))]
            }
            TransportEvent::Ready { .. } => {
                let offerer = self
                    .links
                    .get(&peer)
                    .map(|l| l.role == LinkRole::Offerer)
                    .unwrap_or(false);
                if state != LinkState::Negotiating || !offerer {
                    return Vec::new();
                }
                match self.transport.open_channel(peer) {
                    Ok(()) => Vec::new(),
                    Err(e) => self.fail(peer, ConnectionError::from(e), now_ms),
                }
            }
            TransportEvent::ChannelOpen { .. } => {
                if state != LinkState::Negotiating {
                    return Vec::new();
                }
                if let Some(link) = self.links.get_mut(&peer) {
                    link.state = LinkState::Connected;
                    link.last_heard = now_ms;
                    link.retried = false;
                    link.retry_at = None;
                }
                info!("Connected to {}", peer);
                vec![PeerOutput::Connected { peer }]
            }
            TransportEvent::Message { data, .. } => {
                if state != LinkState::Connected {
                    debug!("Dropping message from {} on {:?} link", peer, state);
                    return Vec::new();
                }
                self.touch(&peer, now_ms);
                vec![PeerOutput::Message { peer, data }]
            }
            TransportEvent::ChannelClosed { .. } => {
                if !matches!(state, LinkState::Negotiating | LinkState::Connected) {
                    return Vec::new();
                }
                info!("Channel to {} closed", peer);
                self.links.remove(&peer);
                self.pending_candidates.remove(&peer);
                self.transport.close(peer);
                vec![PeerOutput::Closed { peer }]
            }
            TransportEvent::Failed { reason, .. } => {
                if matches!(state, LinkState::Closed | LinkState::Failed) {
                    return Vec::new();
                }
                self.fail(
                    peer,
                    ConnectionError::Transport(TransportError::ConnectionFailed(reason)),
                    now_ms,
                )
            }
        }
    }

    /// Record that something arrived from `peer`.
    pub fn touch(&mut self, peer: &CollaboratorId, now_ms: u64) {
        if let Some(link) = self.links.get_mut(peer) {
            link.last_heard = link.last_heard.max(now_ms);
        }
    }

    fn fail(&mut self, peer: CollaboratorId, error: ConnectionError, now_ms: u64) -> Vec<PeerOutput> {
        self.transport.close(peer);
        self.pending_candidates.remove(&peer);
        let retried = self.links.get(&peer).map(|l| l.retried).unwrap_or(true);

        if retried {
            warn!("Giving up on {}: {}", peer, error);
            self.links.remove(&peer);
            return vec![PeerOutput::Unreachable {
                peer,
                retrying: false,
                reason: error.to_string(),
            }];
        }

        let retry_at = now_ms + self.config.retry_delay.as_millis() as u64;
        if let Some(link) = self.links.get_mut(&peer) {
            link.state = LinkState::Failed;
            link.retried = true;
            link.retry_at = Some(retry_at);
        }
        warn!("Link to {} failed ({}), retrying once", peer, error);
        vec![PeerOutput::Unreachable {
            peer,
            retrying: true,
            reason: error.to_string(),
        }]
    }

    // ==================== Timers ====================

    pub fn tick(&mut self, now_ms: u64) -> Vec<PeerOutput> {
        let negotiation_ms = self.config.negotiation_timeout.as_millis() as u64;
        let liveness_ms = self.config.liveness_timeout.as_millis() as u64;

        let mut timed_out = Vec::new();
        let mut silent = Vec::new();
        let mut retry = Vec::new();
        for (peer, link) in &self.links {
            match link.state {
                LinkState::New | LinkState::Negotiating
                    if now_ms.saturating_sub(link.started_at) >= negotiation_ms =>
                {
                    timed_out.push(*peer)
                }
                LinkState::Connected if now_ms.saturating_sub(link.last_heard) >= liveness_ms => {
                    silent.push(*peer)
                }
                LinkState::Failed if link.retry_at.map(|t| now_ms >= t).unwrap_or(false) => {
                    retry.push(*peer)
                }
                _ => {}
            }
        }
        timed_out.sort();
        silent.sort();
        retry.sort();

        let links = &self.links;
        self.pending_candidates.retain(|peer, buffer| {
            let keep = links.contains_key(peer)
                || now_ms.saturating_sub(buffer.since) < negotiation_ms;
            if !keep {
                debug!(
                    "Dropping {} buffered candidates from {} (no link)",
                    buffer.candidates.len(),
                    peer
                );
            }
            keep
        });

        let mut outputs = Vec::new();
        for peer in timed_out {
            outputs.extend(self.fail(peer, ConnectionError::NegotiationTimeout(peer), now_ms));
        }
        for peer in silent {
            warn!("{}", ConnectionError::LivenessTimeout(peer));
            self.transport.close(peer);
            self.links.remove(&peer);
            outputs.push(PeerOutput::Unreachable {
                peer,
                retrying: false,
                reason: ConnectionError::LivenessTimeout(peer).to_string(),
            });
        }
        for peer in retry {
            info!("Retrying link to {}", peer);
            outputs.extend(self.offer(peer, now_ms, true));
        }
        outputs
    }

    // ==================== Data ====================

    /// Send to every connected peer. Returns who it went to.
    pub fn broadcast(&mut self, data: &[u8]) -> Vec<CollaboratorId> {
        let peers = self.connected_peers();
        let mut sent = Vec::with_capacity(peers.len());
        for peer in peers {
            match self.transport.send(peer, data) {
                Ok(()) => sent.push(peer),
                Err(e) => warn!("Failed to send to {}: {}", peer, e),
            }
        }
        sent
    }

    pub fn send_to(&mut self, peer: CollaboratorId, data: &[u8]) -> Result<(), ConnectionError> {
        if self.state(&peer) != Some(LinkState::Connected) {
            return Err(ConnectionError::NotConnected(peer));
        }
        self.transport.send(peer, data)?;
        Ok(())
    }

    /// Close one link (the peer left). Returns true if there was one.
    pub fn disconnect(&mut self, peer: &CollaboratorId) -> bool {
        self.pending_candidates.remove(peer);
        if self.links.remove(peer).is_some() {
            self.transport.close(*peer);
            return true;
        }
        false
    }

    /// Close every link and forget all negotiation state.
    pub fn close_all(&mut self) {
        let peers: Vec<CollaboratorId> = self.links.keys().copied().collect();
        for peer in peers {
            self.transport.close(peer);
        }
        self.links.clear();
        self.pending_candidates.clear();
    }
}
