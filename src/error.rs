//! Error kinds surfaced across the sync engine, config store, and transport.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Every fallible outcome the core can produce, tagged by the recovery
/// policy a caller is expected to apply (see design doc §7).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid pack configuration: {0}")]
    ConfigInvalid(String),

    #[error("config store I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("path '{path}' escapes root '{root}'")]
    PathScope { path: PathBuf, root: PathBuf },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode envelope: {0}")]
    ProtocolDecode(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    ProtocolUnknown(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transfer integrity failure for '{path}': expected md5 {expected}, got {actual}")]
    TransferIntegrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("invalid operation in current state: {0}")]
    ServiceState(String),
}

impl SyncError {
    pub fn path_scope(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        SyncError::PathScope {
            path: path.into(),
            root: root.into(),
        }
    }
}
