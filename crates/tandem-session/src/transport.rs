//! Peer transport seam
//!
//! The negotiator drives a [`PeerLink`] obtained from a [`PeerConnector`]; the
//! link reports asynchronous happenings (local ICE candidates, the data channel
//! opening, inbound lines, failure) as [`PeerEvent`]s on a channel owned by the
//! session. [`crate::webrtc_link`] is the production backend.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tandem_signal::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::SessionError;

/// Sender half handed to a link for reporting events
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Something the peer connection did
pub enum PeerEvent {
    /// A local candidate to trickle to the remote side
    LocalCandidate(IceCandidate),
    /// The data channel is ready for traffic
    ChannelOpen(Arc<dyn DataChannel>),
    /// One text message arrived on the data channel
    Message(String),
    /// The channel or the connection under it is gone
    Closed(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            PeerEvent::Message(m) => f.debug_tuple("Message").field(&m.len()).finish(),
            PeerEvent::Closed(r) => f.debug_tuple("Closed").field(r).finish(),
        }
    }
}

/// An open, ordered text channel to the peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, line: &str) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// One peer connection being negotiated
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the data channel and an offer, and set it as local description
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;

    /// Apply a remote offer and return the answer (already set locally)
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError>;

    /// Apply the remote answer to a previously created offer
    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), SessionError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Factory for peer links
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSender) -> Result<Box<dyn PeerLink>, SessionError>;
}
