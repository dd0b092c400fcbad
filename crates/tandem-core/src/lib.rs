//! Tandem Core - chunk codec, channel protocol and workspace snapshots
//!
//! This crate contains the building blocks shared by the relay and the peer
//! session. It has no dependencies on networking code.

pub mod chunk;
pub mod config;
pub mod edit;
pub mod error;
pub mod ignore;
pub mod path;
pub mod protocol;
pub mod snapshot;

pub use chunk::{ChunkedTransfer, Reassembly, TransferKey, TransferKind, TransferRegistry};
pub use config::{
    Config, ConfigError, IceConfig, RelayConfig, SessionConfig, TransferConfig, WorkspaceConfig,
};
pub use edit::{EditDescriptor, Position, Range};
pub use error::*;
pub use ignore::ExcludeRules;
pub use protocol::{ChannelMessage, Chunk};
pub use snapshot::{
    ChangeHistoryEntry, DirectorySnapshot, FileRecord, Fingerprint, Folder, PreviousVersion,
    Workspace,
};

/// Fragment ceiling for workspace snapshot transfers (14 KB)
pub const WORKSPACE_FRAGMENT_SIZE: usize = 14 * 1024;

/// Fragment ceiling for file content transfers (12 KB)
pub const FILE_FRAGMENT_SIZE: usize = 12 * 1024;

/// Fragment ceiling for edit transfers (10 KB)
pub const EDIT_FRAGMENT_SIZE: usize = 10 * 1024;

/// Most chunks one transfer may announce (under 1 GB of fragments)
pub const MAX_TRANSFER_CHUNKS: u32 = 64 * 1024;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;
