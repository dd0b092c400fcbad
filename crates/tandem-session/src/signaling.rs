//! Relay client
//!
//! Holds one WebSocket to the relay for the life of the session. Inbound
//! envelopes are delivered in arrival order on an event channel; a dropped
//! socket becomes [`SignalingEvent::Closed`] and is never retried.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_signal::SignalEnvelope;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SessionError;

/// What the relay connection produced
#[derive(Debug)]
pub enum SignalingEvent {
    Envelope(SignalEnvelope),
    Closed(String),
}

/// Connected relay client
pub struct SignalingClient {
    local_id: String,
    outbound: mpsc::UnboundedSender<Message>,
}

impl SignalingClient {
    /// Connect to `relay_url` and register `local_id`
    pub async fn connect(
        relay_url: &str,
        local_id: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SessionError> {
        let url = Url::parse(relay_url)
            .map_err(|e| SessionError::Transport(format!("invalid relay url {}: {}", relay_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SessionError::Transport(format!(
                "relay url must use ws:// or wss://, got {}",
                relay_url
            )));
        }

        debug!("Connecting to relay {}", url);
        let (ws, _) = timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SessionError::Timeout(format!("connecting to relay {}", url)))??;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let (events, events_rx) = mpsc::unbounded_channel();
        let pong = outbound.clone();
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match SignalEnvelope::from_json(&text) {
                        Ok(SignalEnvelope::Unknown) => {
                            warn!("Ignoring relay message of unknown type: {}", text);
                        }
                        Ok(envelope) => {
                            if events.send(SignalingEvent::Envelope(envelope)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed relay message: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(_))) | None => break "relay closed the connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("relay connection failed: {}", e),
                }
            };
            info!("Relay connection ended: {}", reason);
            let _ = events.send(SignalingEvent::Closed(reason));
        });

        let client = Self {
            local_id: local_id.to_string(),
            outbound,
        };
        client.send(&SignalEnvelope::Register {
            id: local_id.to_string(),
        })?;
        info!("Registered with relay as {}", local_id);

        Ok((client, events_rx))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Serialize and queue one envelope
    pub fn send(&self, envelope: &SignalEnvelope) -> Result<(), SessionError> {
        let json = envelope.to_json()?;
        debug!("Relay <- {}", envelope.type_name());
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| SessionError::Transport("relay connection is closed".into()))
    }

    /// Close the socket. Queued envelopes are flushed first.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tandem_signal::{RelayServer, SessionDescription};
    use tokio::net::TcpListener;

    async fn start_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::new());
        tokio::spawn(async move { server.serve_listener(listener).await });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let err = SignalingClient::connect("http://localhost:1", "a", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_envelopes_are_relayed() {
        let url = start_relay().await;
        let timeout_ = Duration::from_secs(5);
        let (alice, _alice_rx) = SignalingClient::connect(&url, "alice", timeout_).await.unwrap();
        let (_bob, mut bob_rx) = SignalingClient::connect(&url, "bob", timeout_).await.unwrap();
        assert_eq!(alice.local_id(), "alice");

        let offer = SignalEnvelope::Offer {
            offer: SessionDescription::offer("v=0"),
            to: "bob".into(),
            from: "alice".into(),
        };

        // bob's register may not have reached the relay yet
        let received = timeout(timeout_, async {
            loop {
                alice.send(&offer).unwrap();
                match timeout(Duration::from_millis(200), bob_rx.recv()).await {
                    Ok(Some(SignalingEvent::Envelope(env))) => return env,
                    Ok(other) => panic!("unexpected event: {:?}", other),
                    Err(_) => continue,
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(received, offer);
    }
}
