//! Registered relay clients

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Outbound half of one relay connection
pub type ClientSender = mpsc::UnboundedSender<Message>;

/// A registered connection
pub struct Client {
    /// Distinguishes connections that register the same id
    pub connection: u64,
    pub sender: ClientSender,
}

/// Session id -> live connection
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to a connection. Returns true when an earlier binding was replaced.
    pub fn register(&self, id: &str, connection: u64, sender: ClientSender) -> bool {
        self.clients
            .insert(
                id.to_string(),
                Client {
                    connection,
                    sender,
                },
            )
            .is_some()
    }

    /// Remove `id`, but only if it is still bound to `connection`
    pub fn unregister(&self, id: &str, connection: u64) -> bool {
        self.clients
            .remove_if(id, |_, client| client.connection == connection)
            .is_some()
    }

    /// Queue a frame for `id`. Returns false when nobody is registered under it
    /// or the connection is gone.
    pub fn forward(&self, id: &str, frame: &str) -> bool {
        match self.clients.get(id) {
            Some(client) => client.sender.send(Message::Text(frame.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
