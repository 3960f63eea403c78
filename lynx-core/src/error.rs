//! Error taxonomy shared by every component.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, LynkError>;

#[derive(Debug, thiserror::Error)]
pub enum LynkError {
    /// Manifest, registry, lynk or local file missing.
    #[error("not found: {0}")]
    NotFound(String),
    /// A path was presented where a manifest was expected, or a name is not a plain file name.
    #[error("invalid format: {}", .0.display())]
    InvalidFormat(PathBuf),
    /// Name collision among a lynk's files or among registered lynks.
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// Neither the recorded tracker nor any peer-supplied tracker address accepted a connection.
    #[error("tracker unreachable for lynk {0}")]
    TrackerUnreachable(String),
    /// No peer served the file after every candidate and retry was used.
    #[error("file {file} of lynk {lynk} unavailable from every peer")]
    FileUnavailable { lynk: String, file: String },
    /// Peer accepted the request but the payload failed to decrypt or decompress.
    #[error("corrupt transfer: {0}")]
    TransferCorrupt(String),
    /// A lynk download was stopped before every file arrived.
    #[error("download of lynk {0} stopped")]
    Stopped(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<walkdir::Error> for LynkError {
    fn from(e: walkdir::Error) -> Self {
        LynkError::Io(e.into())
    }
}

impl From<tempfile::PersistError> for LynkError {
    fn from(e: tempfile::PersistError) -> Self {
        LynkError::Io(e.error)
    }
}
