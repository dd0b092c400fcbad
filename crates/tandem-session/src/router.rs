//! Channel message routing
//!
//! Classifies inbound lines, feeds chunked types through the transfer
//! registry and dispatches complete messages. All state here is touched only
//! from the session's event loop.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tandem_core::protocol::{chunked_messages, decode_payload};
use tandem_core::{
    path, ChannelMessage, Chunk, DirectorySnapshot, EditDescriptor, Range, SnapshotError,
    TransferConfig, TransferKey, TransferKind, TransferRegistry,
};
use tracing::{debug, info, warn};

use crate::editor::EditorBridge;
use crate::error::SessionError;
use crate::negotiator::Role;
use crate::peers::{PeerList, PeerStatus};
use crate::SharedWorkspace;

/// Outcome of one inbound message
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Messages to send back, in order
    pub replies: Vec<ChannelMessage>,
    /// The peer greeted us and workspace pushes should start
    pub start_sync: bool,
}

pub struct MessageRouter {
    role: Role,
    local_id: String,
    username: String,
    workspace: Option<SharedWorkspace>,
    mirror: Arc<RwLock<DirectorySnapshot>>,
    peers: Arc<RwLock<PeerList>>,
    transfers: TransferRegistry,
    fragments: TransferConfig,
    scratch_dir: PathBuf,
    editor: Box<dyn EditorBridge>,
    last_seen: Option<Instant>,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        local_id: &str,
        username: &str,
        workspace: Option<SharedWorkspace>,
        fragments: TransferConfig,
        transfer_ttl: Duration,
        scratch_dir: PathBuf,
        editor: Box<dyn EditorBridge>,
    ) -> Self {
        Self {
            role,
            local_id: local_id.to_string(),
            username: username.to_string(),
            workspace,
            mirror: Arc::new(RwLock::new(DirectorySnapshot::default())),
            peers: Arc::new(RwLock::new(PeerList::new())),
            transfers: TransferRegistry::new(transfer_ttl),
            fragments,
            scratch_dir,
            editor,
            last_seen: None,
        }
    }

    /// Received workspace tree (responder side)
    pub fn mirror(&self) -> Arc<RwLock<DirectorySnapshot>> {
        self.mirror.clone()
    }

    pub fn peers(&self) -> Arc<RwLock<PeerList>> {
        self.peers.clone()
    }

    /// Partial transfers in flight
    pub fn pending_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// First message on a fresh channel
    pub fn greeting(&self) -> ChannelMessage {
        ChannelMessage::Greeting {
            id: self.local_id.clone(),
            username: self.username.clone(),
        }
    }

    pub fn disconnect_message(&self) -> ChannelMessage {
        ChannelMessage::Disconnect {
            id: self.local_id.clone(),
        }
    }

    /// Parse and dispatch one line. Bad or rejected messages are logged and
    /// produce no replies.
    pub fn handle_line(&mut self, line: &str) -> Dispatch {
        self.last_seen = Some(Instant::now());
        self.peers.write().set_status(PeerStatus::Online);

        let msg = match ChannelMessage::from_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping channel message: {}", e);
                return Dispatch::default();
            }
        };

        let kind = msg.type_name();
        match self.dispatch(msg) {
            Ok(dispatch) => dispatch,
            Err(SessionError::Unauthorized(reason)) => {
                warn!("Rejected {}: {}", kind, reason);
                Dispatch::default()
            }
            Err(e) => {
                warn!("Failed to handle {}: {}", kind, e);
                Dispatch::default()
            }
        }
    }

    /// Act on one decoded message
    pub fn dispatch(&mut self, msg: ChannelMessage) -> Result<Dispatch, SessionError> {
        if let Some((key, chunk)) = msg.transfer() {
            return self.handle_chunk(key, chunk);
        }

        let mut dispatch = Dispatch::default();
        match msg {
            ChannelMessage::Ping => dispatch.replies.push(ChannelMessage::Pong),
            ChannelMessage::Pong => {}
            ChannelMessage::Greeting { id, username } => {
                if self.peers.write().add(&id, &username) {
                    info!("{} ({}) joined", username, id);
                }
                if self.role == Role::Initiator {
                    dispatch.replies = self.workspace_messages()?;
                    dispatch.start_sync = true;
                }
            }
            ChannelMessage::Disconnect { id } => {
                if let Some(peer) = self.peers.write().remove(&id) {
                    info!("{} ({}) left", peer.username, peer.id);
                }
                self.transfers.clear();
            }
            ChannelMessage::RequestFile { path } => {
                dispatch.replies = self.serve_file(&path)?;
            }
            ChannelMessage::SelectionChange { path, range } => {
                self.editor.highlight_selection(&path, &range);
            }
            ChannelMessage::WorkspaceUpdate(_)
            | ChannelMessage::FileData { .. }
            | ChannelMessage::ApplyEdit { .. } => {}
        }
        Ok(dispatch)
    }

    fn handle_chunk(&mut self, key: TransferKey, chunk: &Chunk) -> Result<Dispatch, SessionError> {
        let encoded = self.transfers.accept(
            key.clone(),
            chunk.index,
            chunk.total,
            chunk.data.clone().into_bytes(),
        )?;
        let Some(encoded) = encoded else {
            debug!("{} chunk {}/{}", key.kind, chunk.index + 1, chunk.total);
            return Ok(Dispatch::default());
        };
        let payload = decode_payload(&encoded)?;
        let target = key.target.unwrap_or_default();

        let mut dispatch = Dispatch::default();
        match key.kind {
            TransferKind::WorkspaceSnapshot => {
                if self.role == Role::Initiator {
                    warn!("Ignoring workspace update: this side owns the workspace");
                    return Ok(dispatch);
                }
                let snapshot = DirectorySnapshot::from_json(&payload)?;
                info!("Workspace mirror updated: {} files", snapshot.file_count());
                self.editor.workspace_changed(&snapshot);
                *self.mirror.write() = snapshot;
            }
            TransferKind::FileContent => {
                let local = path::resolve(&self.scratch_dir, &target)?;
                if let Some(parent) = local.parent() {
                    fs::create_dir_all(parent).map_err(|e| SnapshotError::Io {
                        path: parent.display().to_string(),
                        source: e,
                    })?;
                }
                fs::write(&local, &payload).map_err(|e| SnapshotError::Io {
                    path: local.display().to_string(),
                    source: e,
                })?;
                info!("Received {} ({} bytes)", target, payload.len());
                self.editor.open_file(&target, &local)?;
            }
            TransferKind::Edit => {
                let edit = EditDescriptor::from_json(&payload)?;
                self.editor.apply_edit(&target, &edit)?;
                if self.role == Role::Initiator {
                    dispatch.replies = self.workspace_messages()?;
                }
            }
        }
        Ok(dispatch)
    }

    fn serve_file(&self, rel: &str) -> Result<Vec<ChannelMessage>, SessionError> {
        if self.role != Role::Initiator {
            return Err(SessionError::Unauthorized(format!(
                "{rel}: file requests are served by the initiator"
            )));
        }
        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| SessionError::Unauthorized(format!("{rel}: no workspace")))?;

        let contents = match workspace.lock().read_file(rel) {
            Ok(contents) => contents,
            Err(SnapshotError::PathTraversal(reason)) => {
                return Err(SessionError::Unauthorized(reason))
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Serving {} ({} bytes)", rel, contents.len());
        self.chunked(TransferKind::FileContent, Some(rel), &contents)
    }

    fn chunked(
        &self,
        kind: TransferKind,
        target: Option<&str>,
        payload: &[u8],
    ) -> Result<Vec<ChannelMessage>, SessionError> {
        Ok(chunked_messages(
            kind,
            target,
            payload,
            self.fragments.fragment_size(kind),
        )?)
    }

    /// Full snapshot of the local workspace as `nfsupdate` chunks
    pub fn workspace_messages(&self) -> Result<Vec<ChannelMessage>, SessionError> {
        let Some(workspace) = &self.workspace else {
            return Ok(Vec::new());
        };
        let json = workspace.lock().snapshot().to_json()?;
        self.chunked(TransferKind::WorkspaceSnapshot, None, &json)
    }

    /// Re-scan the workspace; snapshot chunks if it changed
    pub fn poll_workspace(&self) -> Result<Vec<ChannelMessage>, SessionError> {
        let changed = match &self.workspace {
            Some(workspace) => workspace.lock().detect_changes()?,
            None => false,
        };
        if changed {
            self.workspace_messages()
        } else {
            Ok(Vec::new())
        }
    }

    /// Ask the initiator for a file
    pub fn request_file(&self, rel: &str) -> Result<ChannelMessage, SessionError> {
        path::resolve(&self.scratch_dir, rel)?;
        Ok(ChannelMessage::RequestFile {
            path: rel.to_string(),
        })
    }

    /// Chunks carrying one local edit
    pub fn edit_messages(
        &self,
        rel: &str,
        edit: &EditDescriptor,
    ) -> Result<Vec<ChannelMessage>, SessionError> {
        let json = edit.to_json()?;
        self.chunked(TransferKind::Edit, Some(rel), &json)
    }

    pub fn selection_message(&self, rel: &str, range: Range) -> ChannelMessage {
        ChannelMessage::SelectionChange {
            path: rel.to_string(),
            range,
        }
    }

    /// Undo the last write to the workspace
    pub fn rollback(&self) -> Result<String, SessionError> {
        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| SessionError::Snapshot(SnapshotError::NothingToRollBack))?;
        Ok(workspace.lock().rollback()?)
    }

    /// Drop stale partial transfers
    pub fn expire_transfers(&mut self, now: Instant) -> usize {
        let dropped = self.transfers.expire(now);
        if dropped > 0 {
            warn!("Dropped {} stale partial transfers", dropped);
        }
        dropped
    }

    /// Mark peers unresponsive when nothing arrived within `window`
    pub fn check_liveness(&mut self, now: Instant, window: Duration) {
        if let Some(seen) = self.last_seen {
            if now.duration_since(seen) > window {
                self.peers.write().set_status(PeerStatus::Unresponsive);
            }
        }
    }

    /// The channel is gone: forget peers and partial transfers
    pub fn channel_closed(&mut self) {
        self.peers.write().clear();
        self.transfers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::EditorEvent;
    use parking_lot::Mutex;
    use std::path::Path;
    use tandem_core::{Fingerprint, Position, Workspace};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingEditor {
        events: Arc<Mutex<Vec<EditorEvent>>>,
    }

    impl EditorBridge for RecordingEditor {
        fn open_file(&mut self, path: &str, local_copy: &Path) -> Result<(), SessionError> {
            self.events.lock().push(EditorEvent::Opened {
                path: path.into(),
                local_copy: local_copy.into(),
            });
            Ok(())
        }

        fn apply_edit(&mut self, path: &str, edit: &EditDescriptor) -> Result<(), SessionError> {
            self.events.lock().push(EditorEvent::Edited {
                path: path.into(),
                edit: edit.clone(),
            });
            Ok(())
        }

        fn highlight_selection(&mut self, path: &str, range: &Range) {
            self.events.lock().push(EditorEvent::Selection {
                path: path.into(),
                range: *range,
            });
        }

        fn workspace_changed(&mut self, snapshot: &DirectorySnapshot) {
            self.events.lock().push(EditorEvent::WorkspaceChanged {
                files: snapshot.file_count(),
            });
        }
    }

    fn small_fragments() -> TransferConfig {
        TransferConfig {
            workspace_fragment_size: 32,
            file_fragment_size: 8,
            edit_fragment_size: 16,
        }
    }

    fn initiator(files: &[(&str, &str)]) -> (MessageRouter, RecordingEditor, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("workspace");
        fs::create_dir_all(&root).unwrap();
        for (rel, content) in files {
            fs::write(root.join(rel), content).unwrap();
        }
        let workspace = Arc::new(Mutex::new(Workspace::open(&root, &[]).unwrap()));
        let editor = RecordingEditor::default();
        let router = MessageRouter::new(
            Role::Initiator,
            "host",
            "alice",
            Some(workspace),
            small_fragments(),
            Duration::from_secs(60),
            temp.path().join("scratch"),
            Box::new(editor.clone()),
        );
        (router, editor, temp)
    }

    fn responder() -> (MessageRouter, RecordingEditor, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let editor = RecordingEditor::default();
        let router = MessageRouter::new(
            Role::Responder,
            "guest",
            "bob",
            None,
            small_fragments(),
            Duration::from_secs(60),
            temp.path().to_path_buf(),
            Box::new(editor.clone()),
        );
        (router, editor, temp)
    }

    /// Deliver every line to `to`, collecting its replies
    fn deliver(to: &mut MessageRouter, messages: &[ChannelMessage]) -> Vec<ChannelMessage> {
        let mut replies = Vec::new();
        for msg in messages {
            replies.extend(to.handle_line(&msg.to_line()).replies);
        }
        replies
    }

    #[test]
    fn test_greeting_pushes_workspace_to_responder() {
        let (mut host, _, _host_dir) = initiator(&[("a.txt", "hello")]);
        let (mut guest, guest_editor, _guest_dir) = responder();

        let dispatch = host.handle_line(&guest.greeting().to_line());
        assert!(dispatch.start_sync);
        assert!(dispatch.replies.len() > 1, "snapshot should span several chunks");
        assert!(dispatch
            .replies
            .iter()
            .all(|m| matches!(m, ChannelMessage::WorkspaceUpdate(_))));
        assert_eq!(host.peers().read().get("guest").unwrap().username, "bob");

        assert!(deliver(&mut guest, &dispatch.replies).is_empty());

        let mirror = guest.mirror();
        let mirror = mirror.read();
        assert_eq!(mirror.file_count(), 1);
        let record = mirror.file("a.txt").unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(record.fingerprint, Fingerprint::of(b"hello"));
        assert_eq!(
            guest_editor.events.lock().as_slice(),
            [EditorEvent::WorkspaceChanged { files: 1 }]
        );
        assert_eq!(guest.pending_transfers(), 0);
    }

    #[test]
    fn test_responder_greeting_does_not_push() {
        let (host, _, _host_dir) = initiator(&[]);
        let (mut guest, _, _guest_dir) = responder();
        let dispatch = guest.handle_line(&host.greeting().to_line());
        assert!(!dispatch.start_sync);
        assert!(dispatch.replies.is_empty());
        assert_eq!(guest.peers().read().len(), 1);
    }

    #[test]
    fn test_file_request_round_trip() {
        let (mut host, _, _host_dir) = initiator(&[("a.txt", "hello, tandem")]);
        let (mut guest, guest_editor, guest_dir) = responder();

        let request = guest.request_file("a.txt").unwrap();
        let chunks = deliver(&mut host, &[request]);
        assert!(chunks.len() > 1);
        assert!(chunks
            .iter()
            .all(|m| matches!(m, ChannelMessage::FileData { path, .. } if path == "a.txt")));

        deliver(&mut guest, &chunks);
        let local = guest_dir.path().join("a.txt");
        assert_eq!(fs::read_to_string(&local).unwrap(), "hello, tandem");
        assert_eq!(
            guest_editor.events.lock().as_slice(),
            [EditorEvent::Opened {
                path: "a.txt".into(),
                local_copy: local
            }]
        );
    }

    #[test]
    fn test_request_outside_workspace_is_rejected() {
        let (mut host, _, _host_dir) = initiator(&[("a.txt", "hello")]);

        for path in ["/etc/passwd", "../a.txt", "missing.txt"] {
            let msg = ChannelMessage::RequestFile { path: path.into() };
            let dispatch = host.handle_line(&msg.to_line());
            assert!(dispatch.replies.is_empty(), "{path} must not be served");

            let err = host.dispatch(msg).unwrap_err();
            assert!(matches!(err, SessionError::Unauthorized(_)), "{path}: {err}");
        }
    }

    #[test]
    fn test_responder_never_serves_files() {
        let (mut guest, _, guest_dir) = responder();
        fs::write(guest_dir.path().join("a.txt"), "x").unwrap();
        let msg = ChannelMessage::RequestFile {
            path: "a.txt".into(),
        };
        assert!(matches!(
            guest.dispatch(msg),
            Err(SessionError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_edit_reassembled_out_of_order() {
        let (mut sender, _, _sender_dir) = responder();
        let (mut receiver, editor, _receiver_dir) = initiator(&[("a.txt", "hello")]);

        let edit = EditDescriptor::new(Range::new(Position::new(0, 0), Position::new(0, 5)), "howdy");

        // Fragment size that yields exactly three chunks
        let encoded_len = 4 * edit.to_json().unwrap().len().div_ceil(3);
        sender.fragments.edit_fragment_size = encoded_len.div_ceil(3);
        let chunks = sender.edit_messages("a.txt", &edit).unwrap();
        assert_eq!(chunks.len(), 3);

        for i in [2, 0] {
            receiver.handle_line(&chunks[i].to_line());
            assert!(editor.events.lock().is_empty());
        }
        let dispatch = receiver.handle_line(&chunks[1].to_line());

        assert_eq!(
            editor.events.lock().as_slice(),
            [EditorEvent::Edited {
                path: "a.txt".into(),
                edit
            }]
        );
        // The initiator re-publishes its tree after applying an edit
        assert!(!dispatch.replies.is_empty());
        assert_eq!(receiver.pending_transfers(), 0);
    }

    #[test]
    fn test_interleaved_transfers_do_not_collide() {
        let (sender, _, _sender_dir) = responder();
        let (mut receiver, editor, _receiver_dir) = initiator(&[]);

        let e1 = EditDescriptor::new(Range::new(Position::new(0, 0), Position::new(0, 0)), "one");
        let e2 = EditDescriptor::new(Range::new(Position::new(0, 0), Position::new(0, 0)), "two");
        let a = sender.edit_messages("a.txt", &e1).unwrap();
        let b = sender.edit_messages("b.txt", &e2).unwrap();
        assert!(a.len() > 1 && b.len() > 1);

        let mut lines = Vec::new();
        for i in 0..a.len().max(b.len()) {
            lines.extend(a.get(i).map(|m| m.to_line()));
            lines.push(ChannelMessage::Ping.to_line());
            lines.extend(b.get(i).map(|m| m.to_line()));
        }
        for line in &lines {
            receiver.handle_line(line);
        }

        let events = editor.events.lock();
        assert!(events.contains(&EditorEvent::Edited {
            path: "a.txt".into(),
            edit: e1
        }));
        assert!(events.contains(&EditorEvent::Edited {
            path: "b.txt".into(),
            edit: e2
        }));
    }

    #[test]
    fn test_ping_and_malformed_lines() {
        let (mut guest, _, _dir) = responder();
        assert_eq!(guest.handle_line("ping").replies, vec![ChannelMessage::Pong]);
        assert!(guest.handle_line("pong").replies.is_empty());
        assert!(guest.handle_line("bogus 1 2 3").replies.is_empty());
        assert!(guest.handle_line("nfsupdate 5 2 abc").replies.is_empty());
        assert_eq!(guest.pending_transfers(), 0);
    }

    #[test]
    fn test_oversized_chunk_total_is_dropped() {
        let (mut guest, guest_editor, _dir) = responder();
        assert!(guest.handle_line("nfsupdate 0 4294967295 eA==").replies.is_empty());
        assert_eq!(guest.pending_transfers(), 0);
        assert!(guest_editor.events.lock().is_empty());

        // The session keeps working afterwards
        assert_eq!(guest.handle_line("ping").replies, vec![ChannelMessage::Pong]);
    }

    #[test]
    fn test_disconnect_removes_peer_and_partial_transfers() {
        let (mut guest, _, _dir) = responder();
        guest.handle_line(&ChannelMessage::Greeting {
            id: "host".into(),
            username: "alice".into(),
        }
        .to_line());
        guest.handle_line(&ChannelMessage::WorkspaceUpdate(Chunk {
            index: 0,
            total: 2,
            data: "e30".into(),
        })
        .to_line());
        assert_eq!(guest.pending_transfers(), 1);

        guest.handle_line(&ChannelMessage::Disconnect { id: "host".into() }.to_line());
        assert!(guest.peers().read().is_empty());
        assert_eq!(guest.pending_transfers(), 0);
    }

    #[test]
    fn test_selection_goes_to_editor() {
        let (host, _, _host_dir) = initiator(&[]);
        let (mut guest, editor, _dir) = responder();
        let range = Range::new(Position::new(1, 2), Position::new(3, 4));
        guest.handle_line(&host.selection_message("src/lib.rs", range).to_line());
        assert_eq!(
            editor.events.lock().as_slice(),
            [EditorEvent::Selection {
                path: "src/lib.rs".into(),
                range
            }]
        );
    }

    #[test]
    fn test_poll_and_rollback() {
        let (host, _, temp) = initiator(&[("a.txt", "hello")]);
        assert!(host.poll_workspace().unwrap().is_empty());

        fs::write(temp.path().join("workspace/b.txt"), "new").unwrap();
        assert!(!host.poll_workspace().unwrap().is_empty());

        assert!(matches!(
            host.rollback(),
            Err(SessionError::Snapshot(SnapshotError::NothingToRollBack))
        ));
    }

    #[test]
    fn test_liveness() {
        let (mut guest, _, _dir) = responder();
        guest.handle_line(&ChannelMessage::Greeting {
            id: "host".into(),
            username: "alice".into(),
        }
        .to_line());

        let later = Instant::now() + Duration::from_secs(60);
        guest.check_liveness(later, Duration::from_secs(30));
        assert_eq!(
            guest.peers().read().get("host").unwrap().status,
            PeerStatus::Unresponsive
        );

        guest.handle_line("pong");
        assert_eq!(guest.peers().read().get("host").unwrap().status, PeerStatus::Online);
    }
}
