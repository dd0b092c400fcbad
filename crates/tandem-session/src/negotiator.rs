//! Peer connection negotiation
//!
//! ```text
//! Idle -> AwaitingRelay -> Negotiating -> Open -> Closed
//! ```
//!
//! The initiator knows its target and offers as soon as the relay is up. The
//! responder waits for an offer and answers it. Remote candidates that arrive
//! before there is a link with a remote description are held and applied
//! afterwards, up to [`MAX_HELD_CANDIDATES`]. An offer that cannot be applied
//! is dropped and the responder keeps waiting. A closed negotiator is never
//! reopened.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tandem_signal::{IceCandidate, SignalEnvelope};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::transport::{DataChannel, PeerConnector, PeerEventSender, PeerLink};

/// Remote candidates held before they can be applied. The oldest is dropped
/// when a new one arrives at the limit.
pub const MAX_HELD_CANDIDATES: usize = 32;

/// Which side of the session this is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Owns the workspace and makes the offer
    Initiator,
    /// Joins, answers and mirrors the workspace
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingRelay,
    Negotiating,
    Open,
    Closed,
}

pub struct SessionNegotiator {
    role: Role,
    local_id: String,
    remote_id: Option<String>,
    state: NegotiationState,
    connector: Arc<dyn PeerConnector>,
    events: PeerEventSender,
    link: Option<Box<dyn PeerLink>>,
    channel: Option<Arc<dyn DataChannel>>,
    remote_description_set: bool,
    pending_candidates: VecDeque<(String, IceCandidate)>,
    started_at: Option<Instant>,
    timeout: Duration,
}

impl SessionNegotiator {
    pub fn new(
        role: Role,
        local_id: &str,
        remote_id: Option<String>,
        connector: Arc<dyn PeerConnector>,
        events: PeerEventSender,
        timeout: Duration,
    ) -> Self {
        Self {
            role,
            local_id: local_id.to_string(),
            remote_id,
            state: NegotiationState::Idle,
            connector,
            events,
            link: None,
            channel: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            started_at: None,
            timeout,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.state == NegotiationState::Open
    }

    /// The open data channel
    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        if self.is_open() {
            self.channel.clone()
        } else {
            None
        }
    }

    /// When negotiation gives up, while it is in progress
    pub fn deadline(&self) -> Option<Instant> {
        match (self.state, self.started_at) {
            (NegotiationState::Negotiating, Some(started)) => Some(started + self.timeout),
            _ => None,
        }
    }

    /// The relay connection is being opened
    pub fn relay_connecting(&mut self) {
        if self.state == NegotiationState::Idle {
            self.state = NegotiationState::AwaitingRelay;
        }
    }

    /// The relay accepted our registration. The initiator offers to its target.
    pub async fn relay_ready(&mut self) -> Result<Vec<SignalEnvelope>, SessionError> {
        self.relay_connecting();
        if self.role != Role::Initiator {
            info!("Waiting for an offer as {}", self.local_id);
            return Ok(Vec::new());
        }
        let Some(target) = self.remote_id.clone() else {
            info!("No target peer; waiting");
            return Ok(Vec::new());
        };

        let link = self.connector.connect(self.events.clone()).await?;
        let offer = link.create_offer().await?;
        self.link = Some(link);
        self.begin_negotiating();

        info!("Sending offer to {}", target);
        Ok(vec![SignalEnvelope::Offer {
            offer,
            to: target,
            from: self.local_id.clone(),
        }])
    }

    /// Apply one envelope from the relay. Returns envelopes to send back.
    pub async fn handle_envelope(
        &mut self,
        envelope: SignalEnvelope,
    ) -> Result<Vec<SignalEnvelope>, SessionError> {
        if self.state == NegotiationState::Closed {
            debug!("Ignoring {} after close", envelope.type_name());
            return Ok(Vec::new());
        }

        match envelope {
            SignalEnvelope::Offer { offer, from, .. } => {
                if self.role != Role::Responder {
                    warn!("Ignoring offer from {}: this side initiates", from);
                    return Ok(Vec::new());
                }
                if self.link.is_some() {
                    warn!("Ignoring offer from {}: renegotiation is not supported", from);
                    return Ok(Vec::new());
                }

                info!("Offer from {}", from);
                let link = self.connector.connect(self.events.clone()).await?;
                let answer = match link.accept_offer(offer).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!("Dropping offer from {}: {}", from, e);
                        if let Err(e) = link.close().await {
                            debug!("Peer connection close failed: {}", e);
                        }
                        return Ok(Vec::new());
                    }
                };
                self.link = Some(link);
                self.remote_id = Some(from.clone());
                self.remote_description_set = true;
                self.begin_negotiating();
                self.flush_candidates().await;

                Ok(vec![SignalEnvelope::Answer {
                    answer,
                    to: from,
                    from: self.local_id.clone(),
                }])
            }
            SignalEnvelope::Answer { answer, from, .. } => {
                if !self.is_remote(&from) {
                    warn!("Ignoring answer from unexpected peer {}", from);
                    return Ok(Vec::new());
                }
                let Some(link) = &self.link else {
                    warn!("Ignoring answer from {}: no offer outstanding", from);
                    return Ok(Vec::new());
                };
                if self.remote_description_set {
                    warn!("Ignoring duplicate answer from {}", from);
                    return Ok(Vec::new());
                }

                info!("Answer from {}", from);
                link.accept_answer(answer).await?;
                self.remote_description_set = true;
                self.flush_candidates().await;
                Ok(Vec::new())
            }
            SignalEnvelope::Candidate {
                candidate, from, ..
            } => {
                if self.remote_id.is_some() && !self.is_remote(&from) {
                    warn!("Ignoring candidate from unexpected peer {}", from);
                    return Ok(Vec::new());
                }
                match &self.link {
                    Some(link) if self.remote_description_set => {
                        if let Err(e) = link.add_candidate(candidate).await {
                            warn!("Failed to add remote candidate: {}", e);
                        }
                    }
                    _ => {
                        debug!("Holding candidate from {} until negotiation catches up", from);
                        if self.pending_candidates.len() >= MAX_HELD_CANDIDATES {
                            if let Some((dropped, _)) = self.pending_candidates.pop_front() {
                                debug!("Dropping oldest held candidate (from {})", dropped);
                            }
                        }
                        self.pending_candidates.push_back((from, candidate));
                    }
                }
                Ok(Vec::new())
            }
            other => {
                debug!("Ignoring {} envelope", other.type_name());
                Ok(Vec::new())
            }
        }
    }

    /// Wrap a local candidate for the remote side
    pub fn local_candidate(&self, candidate: IceCandidate) -> Option<SignalEnvelope> {
        let to = self.remote_id.clone()?;
        Some(SignalEnvelope::Candidate {
            candidate,
            to,
            from: self.local_id.clone(),
        })
    }

    /// The data channel reported ready
    pub fn channel_open(&mut self, channel: Arc<dyn DataChannel>) {
        if self.state == NegotiationState::Closed {
            return;
        }
        info!("Channel open with {}", self.remote_id.as_deref().unwrap_or("peer"));
        self.channel = Some(channel);
        self.state = NegotiationState::Open;
    }

    /// Tear down the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!("Channel close failed: {}", e);
            }
        }
        if let Some(link) = self.link.take() {
            if let Err(e) = link.close().await {
                debug!("Peer connection close failed: {}", e);
            }
        }
    }

    fn begin_negotiating(&mut self) {
        self.state = NegotiationState::Negotiating;
        self.started_at = Some(Instant::now());
    }

    fn is_remote(&self, id: &str) -> bool {
        self.remote_id.as_deref() == Some(id)
    }

    async fn flush_candidates(&mut self) {
        let Some(link) = &self.link else { return };
        let pending = std::mem::take(&mut self.pending_candidates);
        for (from, candidate) in pending {
            if self.remote_id.as_deref() != Some(from.as_str()) {
                debug!("Discarding held candidate from {}", from);
                continue;
            }
            if let Err(e) = link.add_candidate(candidate).await {
                warn!("Failed to add held candidate: {}", e);
            }
        }
    }
}
