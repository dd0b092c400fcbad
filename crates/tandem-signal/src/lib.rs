//! Tandem Relay
//!
//! Minimal WebSocket relay that lets two tandem sessions find each other.
//! Each client registers a session id; offers, answers and ICE candidates
//! addressed `to` another id are forwarded verbatim. Once the data channel is
//! open the relay is no longer needed.
//!
//! # Protocol
//!
//! 1. Both sides send `{"type":"register","id":...}`
//! 2. The initiator sends an offer to the responder's id
//! 3. The responder answers; both trickle candidates
//! 4. Peers talk directly over the data channel

pub mod messages;
pub mod registry;
pub mod server;

pub use messages::{IceCandidate, RoutingHeader, SessionDescription, SignalEnvelope};
pub use registry::ClientRegistry;
pub use server::RelayServer;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 6789;
