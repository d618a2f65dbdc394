//! Metadata resolution for submitted descriptors.
//!
//! Descriptor files resolve in place. Magnet links are registered with the
//! shared session in metadata-only mode and polled from a separate task, while
//! the caller's loop drives heartbeats, the deadline and cancellation. The
//! temporary registration is removed on every exit path.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use seedkeeper_engine::{AddMode, AddParams, HandleId, Metainfo, RemoveMode};

use crate::descriptor::ContentDescriptor;
use crate::error::TransferError;
use crate::manifest::ContentManifest;
use crate::progress::{TransferObserver, TransferPhase};
use crate::session::SessionHandle;

#[derive(Debug)]
pub enum ProbeOutcome {
    Resolved(ContentManifest),
    Cancelled,
}

/// Who to tell while a magnet's metadata is outstanding.
pub struct Heartbeat<'a> {
    pub observer: &'a dyn TransferObserver,
    pub session_id: &'a str,
}

#[derive(Clone, Debug)]
pub struct MetadataProbe {
    session: SessionHandle,
    scratch_dir: PathBuf,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl MetadataProbe {
    pub fn new(session: SessionHandle, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            scratch_dir: scratch_dir.into(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    pub fn with_intervals(mut self, poll: Duration, heartbeat: Duration) -> Self {
        self.poll_interval = poll;
        self.heartbeat_interval = heartbeat;
        self
    }

    pub async fn resolve(
        &self,
        descriptor: &ContentDescriptor,
        timeout: Duration,
        cancel: &CancellationToken,
        heartbeat: Option<Heartbeat<'_>>,
    ) -> Result<ProbeOutcome, TransferError> {
        match descriptor {
            ContentDescriptor::DirectFile(bytes) => {
                let meta = Metainfo::from_bytes(bytes)?;
                Ok(ProbeOutcome::Resolved(meta.into()))
            }
            ContentDescriptor::PeerDiscovery(_) => {
                let digest = descriptor.digest()?;
                let outcome = self
                    .fetch_from_swarm(descriptor, timeout, cancel, heartbeat)
                    .await?;
                Ok(match outcome {
                    ProbeOutcome::Resolved(mut manifest) => {
                        manifest.digest = digest;
                        ProbeOutcome::Resolved(manifest)
                    }
                    cancelled => cancelled,
                })
            }
        }
    }

    async fn fetch_from_swarm(
        &self,
        descriptor: &ContentDescriptor,
        timeout: Duration,
        cancel: &CancellationToken,
        heartbeat: Option<Heartbeat<'_>>,
    ) -> Result<ProbeOutcome, TransferError> {
        if cancel.is_cancelled() {
            return Ok(ProbeOutcome::Cancelled);
        }
        let started = Instant::now();
        let handle = self
            .session
            .add(AddParams::new(
                descriptor.add_source(),
                self.scratch_dir.clone(),
                AddMode::MetadataOnly,
            ))
            .await?;
        debug!(%handle, "metadata probe registered");

        let mut poller = tokio::spawn(poll_metadata(
            self.session.clone(),
            handle,
            self.poll_interval,
        ));
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut ticks = interval_at(
            started + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(ProbeOutcome::Cancelled),
                joined = &mut poller => {
                    break match joined {
                        Ok(Ok(meta)) => Ok(ProbeOutcome::Resolved(meta.into())),
                        Ok(Err(err)) => Err(err),
                        Err(err) => Err(TransferError::Engine(format!("metadata poll task: {err}"))),
                    };
                }
                _ = &mut deadline => {
                    break Err(TransferError::MetadataTimeout { secs: timeout.as_secs() });
                }
                _ = ticks.tick() => {
                    if let Some(hb) = &heartbeat {
                        hb.observer
                            .heartbeat(hb.session_id, TransferPhase::FetchingMetadata, started.elapsed())
                            .await;
                    }
                }
            }
        };

        poller.abort();
        if let Err(err) = self.session.remove(handle, RemoveMode::KeepData).await {
            warn!(%handle, error = %err, "failed to deregister metadata probe");
        }
        debug!(%handle, elapsed_ms = started.elapsed().as_millis() as u64, "metadata probe released");
        result
    }
}

async fn poll_metadata(
    session: SessionHandle,
    handle: HandleId,
    every: Duration,
) -> Result<Metainfo, TransferError> {
    loop {
        let status = session.status(handle).await?;
        if status.has_metadata {
            if let Some(meta) = session.metainfo(handle).await? {
                return Ok(meta);
            }
        }
        sleep(every).await;
    }
}
