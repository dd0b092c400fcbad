//! Tandem Session - peer negotiation and the collaboration protocol
//!
//! This crate provides:
//! - A relay client that registers a session id and exchanges envelopes
//! - Offer/answer/candidate negotiation of a peer data channel
//! - Routing of channel messages: greetings, workspace mirroring, file
//!   requests, edits and selections
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  envelopes  ┌────────────────────┐  PeerLink   ┌─────────────┐
//! │SignalingClient├────────────▶│ SessionNegotiator  ├────────────▶│  WebRTC     │
//! └──────────────┘             └─────────┬──────────┘             └──────┬──────┘
//!                                        │ DataChannel                   │ PeerEvent
//!                                        ▼                               ▼
//!                              ┌────────────────────┐  EditorBridge ┌─────────────┐
//!                              │   MessageRouter    ├──────────────▶│   Editor    │
//!                              └────────────────────┘               └─────────────┘
//! ```
//!
//! Everything above runs inside one task per session; see [`session`].

use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::Workspace;

pub mod editor;
pub mod error;
pub mod negotiator;
pub mod peers;
pub mod router;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod webrtc_link;

pub use editor::{EditorBridge, EditorEvent, FsEditor};
pub use error::SessionError;
pub use negotiator::{NegotiationState, Role, SessionNegotiator};
pub use peers::{Peer, PeerList, PeerStatus};
pub use router::{Dispatch, MessageRouter};
pub use session::{
    generate_session_id, open_workspace, Session, SessionHandle, SessionOptions, SessionStatus,
};
pub use signaling::{SignalingClient, SignalingEvent};
pub use transport::{DataChannel, PeerConnector, PeerEvent, PeerEventSender, PeerLink};
pub use webrtc_link::WebRtcConnector;

/// Workspace shared between the router and the editor
pub type SharedWorkspace = Arc<Mutex<Workspace>>;
