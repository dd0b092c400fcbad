//! Workspace path containment
//!
//! Paths travel on the wire relative to the workspace root, with `/`
//! separators. Every path received from a peer is resolved through
//! [`resolve`] before it touches the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::ProtocolError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Resolve a peer-supplied relative path inside `root` without touching disk.
///
/// Rejects absolute paths, `..` components, null bytes and over-long names.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, ProtocolError> {
    if relative.contains('\0') {
        return Err(ProtocolError::PathTraversal("path contains null byte".into()));
    }

    if relative.is_empty() {
        return Err(ProtocolError::PathTraversal("empty path".into()));
    }

    if relative.len() > MAX_PATH_LEN {
        return Err(ProtocolError::PathTraversal(format!(
            "path too long: {} bytes (max {})",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    let mut result = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                if name.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::PathTraversal(format!(
                        "filename too long: {} bytes (max {})",
                        name.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ProtocolError::PathTraversal(format!(
                    "{relative}: parent directory (..) not allowed"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ProtocolError::PathTraversal(format!(
                    "{relative}: outside workspace"
                )));
            }
        }
    }

    if result == root {
        return Err(ProtocolError::PathTraversal(format!(
            "{relative}: names the workspace root"
        )));
    }

    Ok(result)
}

/// Resolve and then confirm, following symlinks, that an existing file stays
/// inside `root`.
pub fn resolve_existing(root: &Path, relative: &str) -> Result<PathBuf, ProtocolError> {
    let candidate = resolve(root, relative)?;

    let canonical_root = root
        .canonicalize()
        .map_err(|e| ProtocolError::PathTraversal(format!("cannot canonicalize root: {e}")))?;
    let canonical = candidate
        .canonicalize()
        .map_err(|e| ProtocolError::PathTraversal(format!("{relative}: {e}")))?;

    if !canonical.starts_with(&canonical_root) {
        return Err(ProtocolError::PathTraversal(format!(
            "{relative}: symlink escapes workspace"
        )));
    }
    Ok(canonical)
}

/// Wire form of `path` relative to `root` (`/`-separated)
pub fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
