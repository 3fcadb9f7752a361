//! Metadata types and the single-shot whole-path requests every driver
//! executes.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// File metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// File type
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// File permissions (Unix mode)
    pub mode: u32,
    /// Last modification time
    pub modified: SystemTime,
    /// Last access time
    pub accessed: SystemTime,
    /// Creation time, or modification time where the platform has none
    pub created: SystemTime,
}

impl Metadata {
    pub(crate) fn from_std(meta: &std::fs::Metadata) -> Self {
        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            file_type,
            size: meta.len(),
            mode: permission_bits(meta),
            modified,
            accessed: meta.accessed().unwrap_or(modified),
            created: meta.created().unwrap_or(modified),
        }
    }
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// File type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

impl FileType {
    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Check if this is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// A single-shot whole-path request.
///
/// These need no queuing: each is one request and one response. They are
/// serializable so the delegated strategy can ship them to a worker as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FsRequest {
    Status {
        path: PathBuf,
    },
    LinkStatus {
        path: PathBuf,
    },
    Touch {
        path: PathBuf,
    },
    DeleteFile {
        path: PathBuf,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
    },
    CreateDirectory {
        path: PathBuf,
        recursive: bool,
    },
    DeleteDirectory {
        path: PathBuf,
    },
    ListFiles {
        path: PathBuf,
    },
    ChangePermissions {
        path: PathBuf,
        mode: u32,
    },
    CreateSymlink {
        target: PathBuf,
        link: PathBuf,
    },
    ResolveSymlink {
        path: PathBuf,
    },
    Read {
        path: PathBuf,
    },
    Write {
        path: PathBuf,
        #[serde(with = "crate::worker::protocol::base64_bytes")]
        contents: Vec<u8>,
    },
}

impl FsRequest {
    /// Paths whose cached status is stale once this request succeeds.
    ///
    /// Read-only requests return an empty list.
    pub fn invalidates(&self) -> Vec<&PathBuf> {
        match self {
            Self::Status { .. }
            | Self::LinkStatus { .. }
            | Self::ListFiles { .. }
            | Self::ResolveSymlink { .. }
            | Self::Read { .. } => Vec::new(),
            Self::Touch { path }
            | Self::DeleteFile { path }
            | Self::CreateDirectory { path, .. }
            | Self::DeleteDirectory { path }
            | Self::ChangePermissions { path, .. }
            | Self::Write { path, .. } => vec![path],
            Self::Move { from, to } => vec![from, to],
            Self::CreateSymlink { link, .. } => vec![link],
        }
    }
}

/// Response to an [`FsRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FsResponse {
    /// `Status`/`LinkStatus`; `None` when the path does not exist.
    Status(Option<Metadata>),
    /// `ListFiles`
    Names(Vec<String>),
    /// `ResolveSymlink`
    Path(PathBuf),
    /// `Read`
    Contents(#[serde(with = "crate::worker::protocol::base64_bytes")] Vec<u8>),
    /// Every mutating request.
    Done,
}
