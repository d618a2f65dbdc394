//! Crash-recovery mirror of the active transfer set.
//!
//! The file is pretty-printed JSON mapping session id to record, ordered by
//! key, so an unchanged set always serialises to identical bytes. Write
//! failures are logged and swallowed; a missing or corrupt file loads as empty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs as afs;
use tracing::{debug, warn};

use crate::collab::Classification;
use crate::descriptor::ContentDescriptor;
use crate::progress::TransferPhase;

pub type RecordMap = BTreeMap<String, TransferRecord>;

/// Durable unit of work: everything needed to restart a transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub session_id: String,
    pub descriptor: ContentDescriptor,
    pub destination: PathBuf,
    pub display_name: String,
    #[serde(default)]
    pub classification: Classification,
    pub status: TransferPhase,
    /// Fetched descriptor file to remove once the transfer is over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum PersistenceError {
    #[error("serialising records: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct PersistenceStore {
    path: PathBuf,
}

impl PersistenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encode(records: &RecordMap) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec_pretty(records)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub async fn save(&self, records: &RecordMap) {
        match self.try_save(records).await {
            Ok(()) => debug!(
                target: "seedkeeper::persistence",
                path = %self.path.display(),
                count = records.len(),
                "active transfers saved"
            ),
            Err(err) => warn!(
                target: "seedkeeper::persistence",
                error = %err,
                "failed to save active transfers"
            ),
        }
    }

    pub(crate) async fn try_save(&self, records: &RecordMap) -> Result<(), PersistenceError> {
        let bytes = Self::encode(records)?;
        save_bytes_atomic(&self.path, &bytes)
            .await
            .map_err(|source| PersistenceError::Write {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn load(&self) -> RecordMap {
        let bytes = match afs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return RecordMap::new(),
            Err(err) => {
                warn!(
                    target: "seedkeeper::persistence",
                    path = %self.path.display(),
                    error = %err,
                    "cannot read active transfers; starting empty"
                );
                return RecordMap::new();
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return RecordMap::new();
        }
        match serde_json::from_slice::<RecordMap>(&bytes) {
            Ok(mut records) => {
                // keys are authoritative
                for (key, record) in records.iter_mut() {
                    record.session_id.clone_from(key);
                }
                records
            }
            Err(err) => {
                warn!(
                    target: "seedkeeper::persistence",
                    path = %self.path.display(),
                    error = %err,
                    "active transfers file is malformed; starting empty"
                );
                RecordMap::new()
            }
        }
    }
}

pub(crate) async fn save_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            afs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("tmp");
    afs::write(&tmp, bytes).await?;
    match afs::rename(&tmp, path).await {
        Ok(_) => Ok(()),
        Err(_) => {
            let _ = afs::remove_file(path).await;
            let res = afs::rename(&tmp, path).await;
            if res.is_err() {
                let _ = afs::remove_file(&tmp).await;
            }
            res
        }
    }
}
