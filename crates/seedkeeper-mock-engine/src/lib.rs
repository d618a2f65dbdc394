//! In-process stand-in for a peer-to-peer transfer engine.
//!
//! Progress is driven by status polls rather than wall-clock time: every
//! `status` call on a transferring registration advances it by
//! [`SimulationConfig::bytes_per_poll`]. Payload files are really created under
//! the save path and grown as progress advances, so callers can observe what a
//! remove with or without data deletion leaves behind.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use seedkeeper_engine::metainfo::encode_descriptor;
use seedkeeper_engine::{
    AddMode, AddParams, AddSource, EngineError, EngineState, EngineStatus, HandleId, MagnetLink,
    Metainfo, RemoveMode, TransferSession,
};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub bytes_per_poll: u64,
    /// Status polls a magnet registration needs before metadata shows up.
    pub metadata_polls: u32,
    pub peers: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            bytes_per_poll: 4 * 1024 * 1024,
            metadata_polls: 3,
            peers: 12,
        }
    }
}

struct Registration {
    meta: Option<Metainfo>,
    magnet_hash: Option<String>,
    save_path: PathBuf,
    mode: AddMode,
    done: u64,
    polls: u32,
    paused: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    swarms: HashMap<String, Metainfo>,
    registrations: HashMap<HandleId, Registration>,
    stalled: bool,
    failure: Option<String>,
    closed: bool,
}

pub struct SimulatedSession {
    config: SimulationConfig,
    inner: Mutex<Inner>,
}

impl SimulatedSession {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make content reachable through a magnet URI with the given info-hash.
    pub fn seed(&self, info_hash: &str, meta: Metainfo) {
        self.inner
            .lock()
            .swarms
            .insert(info_hash.to_ascii_lowercase(), meta);
    }

    /// Fabricate content, seed it, and return a magnet URI that resolves to it.
    pub fn seed_content(&self, name: &str, files: &[(&str, u64)]) -> String {
        let bytes = encode_descriptor(name, files, 256 * 1024);
        let meta = match Metainfo::from_bytes(&bytes) {
            Ok(meta) => meta,
            Err(err) => panic!("fabricated descriptor must parse: {err}"),
        };
        let btih = meta.info_hash.clone();
        self.seed(&btih, meta);
        format!("magnet:?xt=urn:btih:{btih}&dn={}", name.replace(' ', "+"))
    }

    /// While stalled, transfers keep reporting status without making progress.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.lock().stalled = stalled;
    }

    /// Report every transferring registration as failed with `message`.
    pub fn set_failure(&self, message: Option<&str>) {
        self.inner.lock().failure = message.map(str::to_string);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn advance(&self, reg: &mut Registration, stalled: bool) -> Result<(), EngineError> {
        if reg.meta.is_none() {
            reg.polls = reg.polls.saturating_add(1);
            return Ok(());
        }
        if reg.mode == AddMode::MetadataOnly || reg.paused || stalled {
            return Ok(());
        }
        let total = reg.meta.as_ref().map(Metainfo::total_size).unwrap_or(0);
        let next = reg.done.saturating_add(self.config.bytes_per_poll).min(total);
        if next != reg.done {
            reg.done = next;
            if let Some(meta) = &reg.meta {
                write_progress(&reg.save_path, meta, reg.done)?;
            }
        }
        Ok(())
    }
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl TransferSession for SimulatedSession {
    fn id(&self) -> &'static str {
        "simulated"
    }

    fn add(&self, params: AddParams) -> Result<HandleId, EngineError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        let (meta, magnet_hash) = match &params.source {
            AddSource::Metainfo(bytes) => (Some(Metainfo::from_bytes(bytes)?), None),
            AddSource::Magnet(uri) => (None, Some(MagnetLink::parse(uri)?.info_hash)),
        };
        let done = match (&meta, params.mode) {
            (Some(meta), AddMode::Transfer) => existing_bytes(&params.save_path, meta),
            _ => 0,
        };
        inner.next_id += 1;
        let id = HandleId(inner.next_id);
        debug!(handle = %id, save_path = %params.save_path.display(), mode = ?params.mode, "simulated add");
        inner.registrations.insert(
            id,
            Registration {
                meta,
                magnet_hash,
                save_path: params.save_path,
                mode: params.mode,
                done,
                polls: 0,
                paused: false,
            },
        );
        Ok(id)
    }

    fn status(&self, handle: HandleId) -> Result<EngineStatus, EngineError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let reg = inner
            .registrations
            .get_mut(&handle)
            .ok_or(EngineError::UnknownHandle(handle))?;
        if reg.meta.is_none() && reg.polls >= self.config.metadata_polls {
            if let Some(hash) = &reg.magnet_hash {
                reg.meta = inner.swarms.get(hash).cloned();
            }
        }
        self.advance(reg, inner.stalled)?;

        let Some(meta) = &reg.meta else {
            return Ok(EngineStatus {
                name: reg.magnet_hash.clone().unwrap_or_default(),
                state: EngineState::DownloadingMetadata,
                num_peers: self.config.peers,
                ..Default::default()
            });
        };
        let total = meta.total_size();
        let mut state = if reg.paused || reg.mode == AddMode::MetadataOnly {
            EngineState::Paused
        } else if reg.done >= total {
            EngineState::Seeding
        } else {
            EngineState::Downloading
        };
        let mut error = None;
        if reg.mode == AddMode::Transfer {
            if let Some(message) = &inner.failure {
                state = EngineState::Error;
                error = Some(message.clone());
            }
        }
        let transferring = state == EngineState::Downloading && !inner.stalled;
        Ok(EngineStatus {
            name: meta.name.clone(),
            state,
            has_metadata: true,
            progress: if total == 0 {
                1.0
            } else {
                reg.done as f64 / total as f64
            },
            download_rate: if transferring {
                self.config.bytes_per_poll
            } else {
                0
            },
            upload_rate: 0,
            num_peers: self.config.peers,
            total_done: reg.done,
            total_wanted: total,
            error,
        })
    }

    fn metainfo(&self, handle: HandleId) -> Result<Option<Metainfo>, EngineError> {
        let inner = self.inner.lock();
        inner
            .registrations
            .get(&handle)
            .map(|reg| reg.meta.clone())
            .ok_or(EngineError::UnknownHandle(handle))
    }

    fn pause(&self, handle: HandleId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let reg = inner
            .registrations
            .get_mut(&handle)
            .ok_or(EngineError::UnknownHandle(handle))?;
        reg.paused = true;
        Ok(())
    }

    fn remove(&self, handle: HandleId, mode: RemoveMode) -> Result<(), EngineError> {
        let reg = self
            .inner
            .lock()
            .registrations
            .remove(&handle)
            .ok_or(EngineError::UnknownHandle(handle))?;
        debug!(handle = %handle, ?mode, "simulated remove");
        if mode == RemoveMode::DeleteData && reg.mode == AddMode::Transfer {
            if let Some(meta) = &reg.meta {
                delete_payload(&reg.save_path, meta)?;
            }
        }
        Ok(())
    }

    fn registered(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    fn shutdown(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.registrations.clear();
        Ok(())
    }
}

fn payload_path(save_path: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(save_path.to_path_buf(), |acc, part| acc.join(part))
}

fn existing_bytes(save_path: &Path, meta: &Metainfo) -> u64 {
    meta.files
        .iter()
        .map(|file| {
            fs::metadata(payload_path(save_path, &file.path))
                .map(|m| m.len().min(file.length))
                .unwrap_or(0)
        })
        .sum()
}

fn write_progress(save_path: &Path, meta: &Metainfo, done: u64) -> Result<(), EngineError> {
    let mut remaining = done;
    for file in &meta.files {
        if remaining == 0 {
            break;
        }
        let len = remaining.min(file.length);
        remaining -= len;
        let path = payload_path(save_path, &file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if handle.metadata()?.len() < len {
            handle.set_len(len)?;
        }
    }
    Ok(())
}

fn delete_payload(save_path: &Path, meta: &Metainfo) -> Result<(), EngineError> {
    for file in &meta.files {
        let path = payload_path(save_path, &file.path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    if meta.files.iter().any(|f| f.path.contains('/')) {
        let root = save_path.join(&meta.name);
        if root.is_dir() {
            fs::remove_dir_all(&root)?;
        }
    }
    Ok(())
}
