//! Relay envelopes
//!
//! JSON objects tagged by `type`. Offers, answers and candidates carry `to`
//! and `from` session ids; the relay forwards them to `to` untouched.

use serde::{Deserialize, Serialize};

/// Messages exchanged through the relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalEnvelope {
    /// Bind this connection to a session id
    Register { id: String },

    /// Session description offer from the initiator
    Offer {
        offer: SessionDescription,
        to: String,
        from: String,
    },

    /// Session description answer from the responder
    Answer {
        answer: SessionDescription,
        to: String,
        from: String,
    },

    /// Trickled ICE candidate
    Candidate {
        candidate: IceCandidate,
        to: String,
        from: String,
    },

    /// Any type this build does not know
    #[serde(other)]
    Unknown,
}

/// SDP blob with its type (`offer` or `answer`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// The routing fields the relay looks at; everything else passes through.
#[derive(Clone, Debug, Deserialize)]
pub struct RoutingHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl SignalEnvelope {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of the envelope type
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalEnvelope::Register { .. } => "register",
            SignalEnvelope::Offer { .. } => "offer",
            SignalEnvelope::Answer { .. } => "answer",
            SignalEnvelope::Candidate { .. } => "candidate",
            SignalEnvelope::Unknown => "unknown",
        }
    }

    /// Sender id, for routed envelopes
    pub fn from(&self) -> Option<&str> {
        match self {
            SignalEnvelope::Offer { from, .. }
            | SignalEnvelope::Answer { from, .. }
            | SignalEnvelope::Candidate { from, .. } => Some(from),
            _ => None,
        }
    }
}

impl RoutingHeader {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
