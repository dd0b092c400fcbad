//! Workspace snapshots and change tracking
//!
//! A [`DirectorySnapshot`] mirrors the files under a workspace root (minus
//! excluded paths) as a folder tree, with a SHA-256 [`Fingerprint`] per file.
//! [`Workspace`] owns the authoritative snapshot on the initiating side,
//! re-scans it to detect changes, and keeps a history of its own writes so the
//! most recent one can be rolled back.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ProtocolError, SnapshotError};
use crate::ignore::ExcludeRules;
use crate::path;

/// SHA-256 digest of a file's bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hash a file without loading it whole
    pub fn of_file(path: &Path) -> io::Result<(Self, u64)> {
        let mut file = fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut file, &mut hasher)?;
        Ok((Self(hasher.finalize().into()), size))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| ProtocolError::Encoding(format!("fingerprint: {e}")))?;
        Ok(Self(out))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One file in a snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub fingerprint: Fingerprint,
    /// Workspace-relative path, `/`-separated
    pub full_path: String,
}

impl FileRecord {
    pub fn from_bytes(full_path: &str, bytes: &[u8]) -> Self {
        Self {
            name: file_name(full_path).to_string(),
            size: bytes.len() as u64,
            fingerprint: Fingerprint::of(bytes),
            full_path: full_path.to_string(),
        }
    }

    fn from_disk(full_path: &str, on_disk: &Path) -> io::Result<Self> {
        let (fingerprint, size) = Fingerprint::of_file(on_disk)?;
        Ok(Self {
            name: file_name(full_path).to_string(),
            size,
            fingerprint,
            full_path: full_path.to_string(),
        })
    }
}

/// A folder node: child folders and files, each keyed by name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    #[serde(default)]
    pub folders: BTreeMap<String, Folder>,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

impl Folder {
    fn count_files(&self) -> usize {
        self.files.len() + self.folders.values().map(Folder::count_files).sum::<usize>()
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a FileRecord>) {
        out.extend(self.files.values());
        for folder in self.folders.values() {
            folder.collect(out);
        }
    }
}

/// Folder tree of a workspace at the time of a scan
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub root: Folder,
}

impl DirectorySnapshot {
    pub fn file(&self, rel: &str) -> Option<&FileRecord> {
        let (dirs, name) = split_parent(rel);
        let mut folder = &self.root;
        for dir in dirs {
            folder = folder.folders.get(dir)?;
        }
        folder.files.get(name)
    }

    pub fn folder(&self, rel: &str) -> Option<&Folder> {
        rel.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(&self.root, |folder, dir| folder.folders.get(dir))
    }

    /// Insert or replace a record, creating parent folders
    pub fn insert_file(&mut self, record: FileRecord) {
        let full_path = record.full_path.clone();
        let (dirs, name) = split_parent(&full_path);
        let folder = self.folder_mut(dirs);
        folder.files.insert(name.to_string(), record);
    }

    pub fn remove_file(&mut self, rel: &str) -> Option<FileRecord> {
        let (dirs, name) = split_parent(rel);
        let mut folder = &mut self.root;
        for dir in dirs {
            folder = folder.folders.get_mut(dir)?;
        }
        folder.files.remove(name)
    }

    /// Every file record, depth-first in name order
    pub fn files(&self) -> Vec<&FileRecord> {
        let mut out = Vec::new();
        self.root.collect(&mut out);
        out
    }

    pub fn file_count(&self) -> usize {
        self.root.count_files()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn folder_mut<'a, I>(&mut self, dirs: I) -> &mut Folder
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut folder = &mut self.root;
        for dir in dirs {
            folder = folder.folders.entry(dir.to_string()).or_default();
        }
        folder
    }
}

/// Walk `root` and fingerprint every file not excluded by `rules`.
///
/// Entries that vanish or cannot be read mid-walk are logged and skipped.
/// Symlinks are not followed.
pub fn scan(root: &Path, rules: &ExcludeRules) -> Result<DirectorySnapshot, SnapshotError> {
    if !root.is_dir() {
        return Err(SnapshotError::NotADirectory(root.display().to_string()));
    }

    let mut snapshot = DirectorySnapshot::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| match path::to_relative(root, e.path()) {
            Some(rel) => !rules.is_excluded(&rel, e.file_type().is_dir()),
            None => true,
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        let Some(rel) = path::to_relative(root, entry.path()) else {
            continue;
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            snapshot.folder_mut(rel.split('/'));
        } else if file_type.is_file() {
            match FileRecord::from_disk(&rel, entry.path()) {
                Ok(record) => snapshot.insert_file(record),
                Err(e) => warn!("Skipping {}: {}", rel, e),
            }
        } else {
            debug!("Skipping non-regular entry {}", rel);
        }
    }

    Ok(snapshot)
}

/// Content a write replaced, kept so the write can be undone
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviousVersion {
    pub record: FileRecord,
    pub content: Vec<u8>,
}

/// One entry of the append-only write history
#[derive(Clone, Debug)]
pub struct ChangeHistoryEntry {
    pub file_path: String,
    /// `None` when the write created the file
    pub previous: Option<PreviousVersion>,
    pub timestamp: DateTime<Utc>,
}

/// The shared directory on the initiating side
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    rules: ExcludeRules,
    snapshot: DirectorySnapshot,
    history: Vec<ChangeHistoryEntry>,
}

impl Workspace {
    /// Load exclude rules from `root` and take the initial snapshot
    pub fn open(root: &Path, extra_excludes: &[String]) -> Result<Self, SnapshotError> {
        let root = root.canonicalize().map_err(|e| SnapshotError::io(root, e))?;
        let rules = ExcludeRules::load(&root, extra_excludes);
        Self::with_rules(root, rules)
    }

    pub fn with_rules(root: PathBuf, rules: ExcludeRules) -> Result<Self, SnapshotError> {
        let snapshot = scan(&root, &rules)?;
        info!(
            "Workspace {:?}: {} files, {} exclude rules",
            root,
            snapshot.file_count(),
            rules.len()
        );
        Ok(Self {
            root,
            rules,
            snapshot,
            history: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> &DirectorySnapshot {
        &self.snapshot
    }

    pub fn history(&self) -> &[ChangeHistoryEntry] {
        &self.history
    }

    /// Re-scan and replace the snapshot. Returns whether anything differs.
    pub fn detect_changes(&mut self) -> Result<bool, SnapshotError> {
        let fresh = scan(&self.root, &self.rules)?;
        let changed = fresh != self.snapshot;
        if changed {
            debug!("Workspace changed: {} files", fresh.file_count());
            self.snapshot = fresh;
        }
        Ok(changed)
    }

    /// Read a file for a peer. The path must resolve inside the workspace.
    pub fn read_file(&self, rel: &str) -> Result<Vec<u8>, SnapshotError> {
        let on_disk = path::resolve_existing(&self.root, rel)?;
        if !on_disk.is_file() {
            return Err(SnapshotError::PathTraversal(format!("{rel}: not a file")));
        }
        fs::read(&on_disk).map_err(|e| SnapshotError::io(&on_disk, e))
    }

    /// Overwrite (or create) a file, recording what it replaced.
    pub fn update(&mut self, rel: &str, contents: &[u8]) -> Result<&FileRecord, SnapshotError> {
        let on_disk = path::resolve(&self.root, rel)?;

        let previous = if on_disk.is_file() {
            let content = fs::read(&on_disk).map_err(|e| SnapshotError::io(&on_disk, e))?;
            let record = self
                .snapshot
                .file(rel)
                .cloned()
                .unwrap_or_else(|| FileRecord::from_bytes(rel, &content));
            Some(PreviousVersion { record, content })
        } else {
            None
        };

        if let Some(parent) = on_disk.parent() {
            fs::create_dir_all(parent).map_err(|e| SnapshotError::io(parent, e))?;
        }
        fs::write(&on_disk, contents).map_err(|e| SnapshotError::io(&on_disk, e))?;

        self.history.push(ChangeHistoryEntry {
            file_path: rel.to_string(),
            previous,
            timestamp: Utc::now(),
        });
        self.snapshot.insert_file(FileRecord::from_bytes(rel, contents));
        debug!("Updated {} ({} bytes)", rel, contents.len());

        self.snapshot
            .file(rel)
            .ok_or_else(|| SnapshotError::PathTraversal(format!("{rel}: not recorded")))
    }

    /// Undo the most recent [`Workspace::update`]. Returns the path restored.
    pub fn rollback(&mut self) -> Result<String, SnapshotError> {
        let entry = self.history.pop().ok_or(SnapshotError::NothingToRollBack)?;
        let on_disk = path::resolve(&self.root, &entry.file_path)?;

        match entry.previous {
            Some(previous) => {
                fs::write(&on_disk, &previous.content)
                    .map_err(|e| SnapshotError::io(&on_disk, e))?;
                self.snapshot.insert_file(previous.record);
                info!("Rolled back {} to its previous content", entry.file_path);
            }
            None => {
                match fs::remove_file(&on_disk) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SnapshotError::io(&on_disk, e)),
                }
                self.snapshot.remove_file(&entry.file_path);
                info!("Rolled back creation of {}", entry.file_path);
            }
        }
        Ok(entry.file_path)
    }
}

fn split_parent(rel: &str) -> (impl Iterator<Item = &str>, &str) {
    let (dirs, name) = match rel.rsplit_once('/') {
        Some((dirs, name)) => (dirs, name),
        None => ("", rel),
    };
    (dirs.split('/').filter(|s| !s.is_empty()), name)
}

fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}
