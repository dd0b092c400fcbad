//! WebRTC peer links
//!
//! One `RTCPeerConnection` per session with a single ordered data channel
//! labelled `tandem`. Candidates are trickled: every local candidate is
//! reported as soon as the ICE agent produces it.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_signal::{IceCandidate, SessionDescription};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::SessionError;
use crate::transport::{DataChannel, PeerConnector, PeerEvent, PeerEventSender, PeerLink};

/// Label of the single data channel
pub const CHANNEL_LABEL: &str = "tandem";

/// Builds WebRTC peer connections
pub struct WebRtcConnector {
    stun_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    fn api() -> Result<API, SessionError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        Ok(APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build())
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: PeerEventSender) -> Result<Box<dyn PeerLink>, SessionError> {
        let pc = Arc::new(Self::api()?.new_peer_connection(self.configuration()).await?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(from_init(init)));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {}", state);
                match state {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        let _ = tx.send(PeerEvent::Closed(format!("peer connection {}", state)));
                    }
                    _ => {}
                }
            })
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Remote opened data channel {}", dc.label());
                attach_channel(&dc, tx);
            })
        }));

        Ok(Box::new(WebRtcLink { pc, events }))
    }
}

/// A negotiated (or negotiating) WebRTC connection
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let dc = self.pc.create_data_channel(CHANNEL_LABEL, None).await?;
        attach_channel(&dc, self.events.clone());

        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        self.pc
            .set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
            .await?;

        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), SessionError> {
        self.pc
            .set_remote_description(RTCSessionDescription::answer(answer.sdp)?)
            .await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.pc.add_ice_candidate(to_init(candidate)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send_text(&self, line: &str) -> Result<(), SessionError> {
        self.dc.send_text(line.to_string()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.dc.close().await?;
        Ok(())
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, events: PeerEventSender) {
    let opened = dc.clone();
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            info!("Data channel {} open", opened.label());
            let _ = tx.send(PeerEvent::ChannelOpen(Arc::new(WebRtcChannel { dc: opened })));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(line) => {
                    let _ = tx.send(PeerEvent::Message(line));
                }
                Err(_) => warn!("Dropping non-text data channel message ({} bytes)", msg.data.len()),
            }
        })
    }));

    dc.on_close(Box::new(move || {
        let tx = events.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::Closed("data channel closed".into()));
        })
    }));
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_conversion() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert_eq!(from_init(to_init(candidate.clone())), candidate);
    }

    #[test]
    fn test_configuration_without_stun() {
        let connector = WebRtcConnector::new(Vec::new());
        assert!(connector.configuration().ice_servers.is_empty());

        let connector = WebRtcConnector::new(vec!["stun:stun.l.google.com:19302".into()]);
        assert_eq!(connector.configuration().ice_servers[0].urls.len(), 1);
    }
}
