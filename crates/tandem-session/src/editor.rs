//! Editor collaborator boundary
//!
//! The router hands completed remote actions to an [`EditorBridge`]. Editor
//! integrations implement it; [`FsEditor`] is the default and works directly
//! on files.

use std::fs;
use std::path::{Path, PathBuf};

use tandem_core::{path, DirectorySnapshot, EditDescriptor, ProtocolError, Range, SnapshotError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::SharedWorkspace;

/// Receives remote actions for display or application
pub trait EditorBridge: Send {
    /// A requested file arrived and was written to `local_copy`
    fn open_file(&mut self, path: &str, local_copy: &Path) -> Result<(), SessionError>;

    /// Apply a remote edit to the document at `path`
    fn apply_edit(&mut self, path: &str, edit: &EditDescriptor) -> Result<(), SessionError>;

    /// Transiently highlight the remote selection
    fn highlight_selection(&mut self, path: &str, range: &Range);

    /// The mirrored workspace tree was replaced
    fn workspace_changed(&mut self, snapshot: &DirectorySnapshot);
}

/// What [`FsEditor`] did, for whoever is watching
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditorEvent {
    Opened { path: String, local_copy: PathBuf },
    Edited { path: String, edit: EditDescriptor },
    Selection { path: String, range: Range },
    WorkspaceChanged { files: usize },
}

/// File-backed editor.
///
/// On the initiating side edits go through the shared [`tandem_core::Workspace`]
/// so they land in its history and can be rolled back. On the joining side
/// they are applied to the local copies under the scratch directory.
pub struct FsEditor {
    workspace: Option<SharedWorkspace>,
    scratch_dir: PathBuf,
    events: Option<mpsc::UnboundedSender<EditorEvent>>,
}

impl FsEditor {
    pub fn new(workspace: Option<SharedWorkspace>, scratch_dir: PathBuf) -> Self {
        Self {
            workspace,
            scratch_dir,
            events: None,
        }
    }

    /// Report every action on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<EditorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn notify(&self, event: EditorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn edit_scratch_copy(&self, rel: &str, edit: &EditDescriptor) -> Result<(), SessionError> {
        let local = path::resolve(&self.scratch_dir, rel)?;
        let document = match fs::read(&local) {
            Ok(bytes) => into_text(rel, bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_error(&local, e)),
        };
        let updated = edit.apply_to(&document)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        fs::write(&local, updated).map_err(|e| io_error(&local, e))?;
        Ok(())
    }
}

impl EditorBridge for FsEditor {
    fn open_file(&mut self, path: &str, local_copy: &Path) -> Result<(), SessionError> {
        info!("Opened {} at {:?}", path, local_copy);
        self.notify(EditorEvent::Opened {
            path: path.to_string(),
            local_copy: local_copy.to_path_buf(),
        });
        Ok(())
    }

    fn apply_edit(&mut self, rel: &str, edit: &EditDescriptor) -> Result<(), SessionError> {
        match &self.workspace {
            Some(workspace) => {
                let mut workspace = workspace.lock();
                let document = into_text(rel, workspace.read_file(rel)?)?;
                let updated = edit.apply_to(&document)?;
                workspace.update(rel, updated.as_bytes())?;
            }
            None => self.edit_scratch_copy(rel, edit)?,
        }
        debug!("Applied edit to {}", rel);
        self.notify(EditorEvent::Edited {
            path: rel.to_string(),
            edit: edit.clone(),
        });
        Ok(())
    }

    fn highlight_selection(&mut self, path: &str, range: &Range) {
        debug!(
            "Peer selection in {}: {}:{}-{}:{}",
            path, range.start.line, range.start.character, range.end.line, range.end.character
        );
        self.notify(EditorEvent::Selection {
            path: path.to_string(),
            range: *range,
        });
    }

    fn workspace_changed(&mut self, snapshot: &DirectorySnapshot) {
        self.notify(EditorEvent::WorkspaceChanged {
            files: snapshot.file_count(),
        });
    }
}

fn into_text(rel: &str, bytes: Vec<u8>) -> Result<String, ProtocolError> {
    String::from_utf8(bytes)
        .map_err(|_| ProtocolError::Encoding(format!("{rel} is not valid UTF-8 text")))
}

fn io_error(path: &Path, source: std::io::Error) -> SessionError {
    SessionError::Snapshot(SnapshotError::Io {
        path: path.display().to_string(),
        source,
    })
}
