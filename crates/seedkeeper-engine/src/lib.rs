//! Transfer-engine contract for seedkeeper.
//!
//! The supervisor never talks to a peer-to-peer library directly. It drives a
//! [`TransferSession`], a long-lived, internally thread-safe handle shaped after
//! the classic libtorrent session: registrations are added, polled for status
//! and removed, optionally deleting their data. Calls are blocking; callers in
//! async code are expected to isolate them on a blocking worker.
//!
//! The [`metainfo`] module holds the descriptor parsing both sides need:
//! bencoded descriptor files and magnet URIs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod metainfo;

pub use metainfo::{FileEntry, MagnetLink, Metainfo, MetainfoError};

/// Opaque identifier for one registration inside a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    CheckingFiles,
    #[default]
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    Paused,
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::CheckingFiles => "checking_files",
            EngineState::DownloadingMetadata => "downloading_metadata",
            EngineState::Downloading => "downloading",
            EngineState::Finished => "finished",
            EngineState::Seeding => "seeding",
            EngineState::Paused => "paused",
            EngineState::Error => "error",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            EngineState::CheckingFiles => "Checking files",
            EngineState::DownloadingMetadata => "Fetching metadata",
            EngineState::Downloading => "Downloading",
            EngineState::Finished => "Finished",
            EngineState::Seeding => "Seeding",
            EngineState::Paused => "Paused",
            EngineState::Error => "Error",
        }
    }

    /// True once every wanted byte is on disk.
    pub fn is_complete(&self) -> bool {
        matches!(self, EngineState::Finished | EngineState::Seeding)
    }
}

/// Point-in-time status of one registration, as reported by the engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineStatus {
    pub name: String,
    pub state: EngineState,
    pub has_metadata: bool,
    /// Fraction complete in `0.0..=1.0`.
    pub progress: f64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub num_peers: u32,
    pub total_done: u64,
    pub total_wanted: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddSource {
    /// Raw bytes of a descriptor file.
    Metainfo(Vec<u8>),
    /// Peer-discovery URI; metadata must be fetched from the swarm.
    Magnet(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddMode {
    /// Fetch metadata only: no payload is written and uploads are suppressed.
    MetadataOnly,
    Transfer,
}

#[derive(Clone, Debug)]
pub struct AddParams {
    pub source: AddSource,
    pub save_path: PathBuf,
    pub mode: AddMode,
}

impl AddParams {
    pub fn new(source: AddSource, save_path: impl Into<PathBuf>, mode: AddMode) -> Self {
        Self {
            source,
            save_path: save_path.into(),
            mode,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveMode {
    KeepData,
    DeleteData,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unknown handle {0}")]
    UnknownHandle(HandleId),
    #[error("session closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
    #[error("engine failure: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<MetainfoError> for EngineError {
    fn from(err: MetainfoError) -> Self {
        EngineError::InvalidDescriptor(err.to_string())
    }
}

/// A long-lived handle to the underlying transfer engine.
///
/// Implementations must tolerate concurrent calls from many transfers. Every
/// method may block on engine locks or disk I/O.
pub trait TransferSession: Send + Sync + 'static {
    fn id(&self) -> &'static str;

    fn add(&self, params: AddParams) -> Result<HandleId, EngineError>;

    fn status(&self, handle: HandleId) -> Result<EngineStatus, EngineError>;

    /// Resolved metadata, or `None` while it is still being fetched.
    fn metainfo(&self, handle: HandleId) -> Result<Option<Metainfo>, EngineError>;

    /// Pause the registration and flush buffered data to disk.
    fn pause(&self, handle: HandleId) -> Result<(), EngineError>;

    fn remove(&self, handle: HandleId, mode: RemoveMode) -> Result<(), EngineError>;

    /// Number of registrations currently held by the session.
    fn registered(&self) -> usize;

    /// Tear the session down. Only the lifecycle owner calls this.
    fn shutdown(&self) -> Result<(), EngineError>;
}

pub type BoxedSession = Box<dyn TransferSession>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_state_labels_match_snake_case() {
        assert_eq!(EngineState::CheckingFiles.as_str(), "checking_files");
        assert_eq!(
            EngineState::DownloadingMetadata.as_str(),
            "downloading_metadata"
        );
        assert_eq!(EngineState::Seeding.as_str(), "seeding");
        assert_eq!(EngineState::Error.as_str(), "error");
    }

    #[test]
    fn only_finished_and_seeding_are_complete() {
        assert!(EngineState::Finished.is_complete());
        assert!(EngineState::Seeding.is_complete());
        assert!(!EngineState::Downloading.is_complete());
        assert!(!EngineState::Paused.is_complete());
    }

    #[test]
    fn metainfo_errors_map_to_invalid_descriptor() {
        let err: EngineError = MetainfoError::Truncated.into();
        assert!(matches!(err, EngineError::InvalidDescriptor(_)));
    }
}
