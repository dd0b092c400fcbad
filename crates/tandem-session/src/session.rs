//! Session lifecycle
//!
//! [`Session::start`] spawns one task that owns the relay client, the
//! negotiator and the router, and serializes every event source through a
//! single `select!` loop:
//!
//! - relay envelopes
//! - peer connection events (candidates, channel open, inbound lines, close)
//! - commands from the [`SessionHandle`]
//! - the workspace poll, ping, transfer sweep and negotiation deadline timers
//!
//! The handle observes progress through a status watch channel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tandem_core::{
    ChannelMessage, Config, ConfigError, DirectorySnapshot, EditDescriptor, Range, Workspace,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::editor::EditorBridge;
use crate::error::SessionError;
use crate::negotiator::{NegotiationState, Role, SessionNegotiator};
use crate::peers::{Peer, PeerList};
use crate::router::MessageRouter;
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::transport::{PeerConnector, PeerEvent};
use crate::SharedWorkspace;

/// Externally visible session state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    AwaitingRelay,
    Negotiating,
    Open,
    Closed(String),
}

impl SessionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionStatus::Closed(_))
    }
}

/// Per-session choices not covered by [`Config`]
#[derive(Default)]
pub struct SessionOptions {
    /// Session id to offer to (initiator)
    pub peer: Option<String>,
    /// Shared workspace; required for the initiator
    pub workspace: Option<SharedWorkspace>,
    /// Use this id instead of a random one
    pub local_id: Option<String>,
    /// Overrides the configured username
    pub username: Option<String>,
}

enum Command {
    RequestFile(String),
    SendEdit { path: String, edit: EditDescriptor },
    SendSelection { path: String, range: Range },
    Rollback(oneshot::Sender<Result<String, SessionError>>),
    Disconnect,
}

pub struct Session;

impl Session {
    /// Validate the configuration and spawn the session task
    pub fn start(
        config: Config,
        role: Role,
        options: SessionOptions,
        connector: Arc<dyn PeerConnector>,
        editor: Box<dyn EditorBridge>,
    ) -> Result<SessionHandle, SessionError> {
        config.validate()?;
        if role == Role::Initiator && options.workspace.is_none() {
            return Err(ConfigError::MissingWorkspace.into());
        }

        let local_id = match options.local_id {
            Some(id) => id,
            None => generate_session_id()?,
        };
        let username = options
            .username
            .or_else(|| config.session.username.clone())
            .unwrap_or_else(default_username);

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let negotiator = SessionNegotiator::new(
            role,
            &local_id,
            options.peer,
            connector,
            peer_tx,
            config.negotiation_timeout(),
        );
        let router = MessageRouter::new(
            role,
            &local_id,
            &username,
            options.workspace,
            config.transfer,
            config.transfer_ttl(),
            config.scratch_dir(&local_id),
            editor,
        );

        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let peers = router.peers();
        let mirror = router.mirror();

        info!("Starting {} session {} as {}", role, local_id, username);
        let task = SessionTask {
            config,
            local_id: local_id.clone(),
            negotiator,
            router,
            status: status_tx,
            commands: command_rx,
            peer_events: peer_rx,
        };

        Ok(SessionHandle {
            id: local_id,
            role,
            commands: command_tx,
            status: status_rx,
            peers,
            mirror,
            task: tokio::spawn(task.run()),
        })
    }
}

/// Open `root` as a shareable workspace
pub fn open_workspace(root: &Path, config: &Config) -> Result<SharedWorkspace, SessionError> {
    let workspace = Workspace::open(root, &config.workspace.exclude)?;
    Ok(Arc::new(Mutex::new(workspace)))
}

/// Random session id: 8 bytes, hex
pub fn generate_session_id() -> Result<String, SessionError> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| SessionError::Transport(format!("random source unavailable: {e}")))?;
    Ok(hex::encode(bytes))
}

fn default_username() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "anonymous".into())
}

/// Control and observation of a running session
pub struct SessionHandle {
    id: String,
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    peers: Arc<RwLock<PeerList>>,
    mirror: Arc<RwLock<DirectorySnapshot>>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `pred` or the session task ends
    pub async fn wait_for(&self, pred: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = self.status.clone();
        loop {
            {
                let status = rx.borrow_and_update();
                if pred(&status) {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().iter().cloned().collect()
    }

    /// Last workspace tree received from the initiator
    pub fn mirror(&self) -> DirectorySnapshot {
        self.mirror.read().clone()
    }

    pub fn request_file(&self, path: &str) -> Result<(), SessionError> {
        self.command(Command::RequestFile(path.to_string()))
    }

    pub fn send_edit(&self, path: &str, edit: EditDescriptor) -> Result<(), SessionError> {
        self.command(Command::SendEdit {
            path: path.to_string(),
            edit,
        })
    }

    pub fn send_selection(&self, path: &str, range: Range) -> Result<(), SessionError> {
        self.command(Command::SendSelection {
            path: path.to_string(),
            range,
        })
    }

    /// Undo the most recent workspace write. Returns the restored path.
    pub async fn rollback(&self) -> Result<String, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Rollback(tx))?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Say goodbye to the peer and wait for teardown
    pub async fn disconnect(self) -> Result<(), SessionError> {
        let _ = self.commands.send(Command::Disconnect);
        self.join().await
    }

    /// Wait for the session task to finish
    pub async fn join(self) -> Result<(), SessionError> {
        self.task
            .await
            .map_err(|e| SessionError::Transport(format!("session task failed: {e}")))?
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

struct SessionTask {
    config: Config,
    local_id: String,
    negotiator: SessionNegotiator,
    router: MessageRouter,
    status: watch::Sender<SessionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl SessionTask {
    async fn run(mut self) -> Result<(), SessionError> {
        self.negotiator.relay_connecting();
        self.publish();

        let connect_timeout = Duration::from_secs(self.config.relay.connect_timeout_secs);
        let connected =
            SignalingClient::connect(&self.config.relay.url, &self.local_id, connect_timeout).await;
        let (signaling, mut relay) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Relay unavailable: {}", e);
                self.negotiator.close().await;
                self.status.send_replace(SessionStatus::Closed(e.to_string()));
                return Err(e);
            }
        };

        let outcome = self.drive(&signaling, &mut relay).await;

        self.router.channel_closed();
        self.negotiator.close().await;
        signaling.close();

        let reason = match &outcome {
            Ok(reason) => reason.clone(),
            Err(e) => e.to_string(),
        };
        info!("Session {} closed: {}", self.local_id, reason);
        self.status.send_replace(SessionStatus::Closed(reason));
        outcome.map(|_| ())
    }

    /// Run until the session ends. Ok carries the reason for a clean close.
    async fn drive(
        &mut self,
        signaling: &SignalingClient,
        relay: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> Result<String, SessionError> {
        for envelope in self.negotiator.relay_ready().await? {
            signaling.send(&envelope)?;
        }
        self.publish();

        let ping_every = self.config.ping_interval();
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        let poll_every = self.config.poll_interval();
        let mut poll = interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_every = (self.config.transfer_ttl() / 2).max(Duration::from_secs(1));
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
        let mut syncing = false;

        loop {
            let deadline = self.negotiator.deadline();
            let negotiation_timeout =
                sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)));

            tokio::select! {
                event = relay.recv() => match event {
                    Some(SignalingEvent::Envelope(envelope)) => {
                        for reply in self.negotiator.handle_envelope(envelope).await? {
                            signaling.send(&reply)?;
                        }
                        self.publish();
                    }
                    Some(SignalingEvent::Closed(reason)) => {
                        return Err(SessionError::Transport(reason));
                    }
                    None => return Err(SessionError::Transport("relay connection lost".into())),
                },

                Some(event) = self.peer_events.recv() => match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        if let Some(envelope) = self.negotiator.local_candidate(candidate) {
                            signaling.send(&envelope)?;
                        }
                    }
                    PeerEvent::ChannelOpen(channel) => {
                        self.negotiator.channel_open(channel);
                        self.publish();
                        let greeting = self.router.greeting();
                        self.send(vec![greeting]).await;
                    }
                    PeerEvent::Message(line) => {
                        let dispatch = self.router.handle_line(&line);
                        self.send(dispatch.replies).await;
                        if dispatch.start_sync && !syncing {
                            debug!("Starting workspace sync every {:?}", poll_every);
                            syncing = true;
                            poll.reset();
                        }
                    }
                    PeerEvent::Closed(reason) => return Ok(reason),
                },

                command = self.commands.recv() => match command {
                    Some(Command::Disconnect) | None => {
                        let farewell = self.router.disconnect_message();
                        self.send(vec![farewell]).await;
                        return Ok("disconnected".into());
                    }
                    Some(command) => self.handle_command(command).await,
                },

                _ = poll.tick(), if syncing => match self.router.poll_workspace() {
                    Ok(messages) => self.send(messages).await,
                    Err(e) => warn!("Workspace scan failed: {}", e),
                },

                _ = ping.tick() => {
                    if self.negotiator.is_open() {
                        self.send(vec![ChannelMessage::Ping]).await;
                        self.router.check_liveness(std::time::Instant::now(), ping_every * 2);
                    }
                }

                _ = sweep.tick() => {
                    self.router.expire_transfers(std::time::Instant::now());
                }

                _ = negotiation_timeout, if deadline.is_some() => {
                    return Err(SessionError::Timeout(format!(
                        "no connection to {} within {:?}",
                        self.negotiator.remote_id().unwrap_or("peer"),
                        self.config.negotiation_timeout()
                    )));
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestFile(path) => match self.router.request_file(&path) {
                Ok(msg) => self.send(vec![msg]).await,
                Err(e) => warn!("Not requesting {}: {}", path, e),
            },
            Command::SendEdit { path, edit } => match self.router.edit_messages(&path, &edit) {
                Ok(messages) => self.send(messages).await,
                Err(e) => warn!("Not sending edit for {}: {}", path, e),
            },
            Command::SendSelection { path, range } => {
                let msg = self.router.selection_message(&path, range);
                self.send(vec![msg]).await;
            }
            Command::Rollback(reply) => {
                let result = self.router.rollback();
                if result.is_ok() {
                    match self.router.workspace_messages() {
                        Ok(messages) => self.send(messages).await,
                        Err(e) => warn!("Failed to publish workspace after rollback: {}", e),
                    }
                }
                let _ = reply.send(result);
            }
            Command::Disconnect => {}
        }
    }

    async fn send(&mut self, messages: Vec<ChannelMessage>) {
        if messages.is_empty() {
            return;
        }
        let Some(channel) = self.negotiator.channel() else {
            warn!("Dropping {} outbound messages: channel not open", messages.len());
            return;
        };
        for msg in messages {
            if let Err(e) = channel.send_text(&msg.to_line()).await {
                warn!("Failed to send {}: {}", msg.type_name(), e);
                return;
            }
        }
    }

    fn publish(&self) {
        let status = match self.negotiator.state() {
            NegotiationState::Idle => SessionStatus::Idle,
            NegotiationState::AwaitingRelay => SessionStatus::AwaitingRelay,
            NegotiationState::Negotiating => SessionStatus::Negotiating,
            NegotiationState::Open => SessionStatus::Open,
            NegotiationState::Closed => return,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!("Session status: {:?}", status);
                *current = status;
                true
            }
        });
    }
}
