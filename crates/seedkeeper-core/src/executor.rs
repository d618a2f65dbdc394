//! One transfer, from submitted descriptor to data on disk.
//!
//! ```text
//! Queued -> Probing | FetchingMetadata -> Validating -> Transferring -> Finalizing
//!        -> Completed | Cancelled | Failed
//! ```
//!
//! Cancellation is observed at every suspension point. What it means is
//! decided there, from the live shutdown flag: a user abort removes partial
//! data, a shutdown keeps it and leaves the record for the next start.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seedkeeper_engine::{AddMode, AddParams, EngineState, HandleId, RemoveMode};

use crate::active::ActiveSet;
use crate::collab::LibraryNotifier;
use crate::config::TransferConfig;
use crate::descriptor::ContentDescriptor;
use crate::error::TransferError;
use crate::manifest::ContentManifest;
use crate::persistence::TransferRecord;
use crate::policy::PolicyValidator;
use crate::probe::{Heartbeat, MetadataProbe, ProbeOutcome};
use crate::progress::{ProgressThrottle, TransferObserver, TransferPhase, TransferStatus};
use crate::session::SessionHandle;
use crate::shutdown::{cancellation_behavior, CancelAction, ShutdownFlag};

#[derive(Clone, Debug, PartialEq)]
pub enum TransferOutcome {
    Completed {
        display_name: String,
        destination: PathBuf,
    },
    /// Stopped by the user; partial data was removed.
    Cancelled,
    /// Stopped by shutdown; partial data and the record were kept.
    Suspended,
    Failed(TransferError),
}

impl TransferOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferOutcome::Completed { .. } => "completed",
            TransferOutcome::Cancelled => "cancelled",
            TransferOutcome::Suspended => "suspended",
            TransferOutcome::Failed(_) => "failed",
        }
    }

    pub fn phase(&self) -> TransferPhase {
        match self {
            TransferOutcome::Completed { .. } => TransferPhase::Completed,
            TransferOutcome::Cancelled | TransferOutcome::Suspended => TransferPhase::Cancelled,
            TransferOutcome::Failed(_) => TransferPhase::Failed,
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Completed {
                display_name,
                destination,
            } => write!(f, "{display_name} finished in {}", destination.display()),
            TransferOutcome::Cancelled => f.write_str("cancelled; partial data removed"),
            TransferOutcome::Suspended => f.write_str("suspended; will resume on next start"),
            TransferOutcome::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Shared by every executor the supervisor starts.
pub(crate) struct ExecutorContext {
    pub(crate) session: SessionHandle,
    pub(crate) observer: Arc<dyn TransferObserver>,
    pub(crate) shutdown: ShutdownFlag,
    pub(crate) active: Arc<ActiveSet>,
    pub(crate) probe: MetadataProbe,
    pub(crate) validator: PolicyValidator,
    pub(crate) transfer: TransferConfig,
    pub(crate) probe_timeout: Duration,
    pub(crate) rename_on_redirect: bool,
    pub(crate) notifier: Arc<dyn LibraryNotifier>,
}

pub(crate) type AdmissionSender = oneshot::Sender<Result<ContentManifest, TransferError>>;

pub(crate) struct TransferExecutor {
    ctx: Arc<ExecutorContext>,
    record: TransferRecord,
    cancel: CancellationToken,
    skip_validation: bool,
    admission: Option<AdmissionSender>,
    outcome: Option<oneshot::Sender<TransferOutcome>>,
}

enum Step<T> {
    Next(T),
    Stop(TransferOutcome),
}

impl TransferExecutor {
    pub(crate) fn new(
        ctx: Arc<ExecutorContext>,
        record: TransferRecord,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            record,
            cancel,
            skip_validation: false,
            admission: None,
            outcome: None,
        }
    }

    /// Resume path for content that was validated before a restart.
    pub(crate) fn skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    pub(crate) fn with_admission(mut self, tx: AdmissionSender) -> Self {
        self.admission = Some(tx);
        self
    }

    pub(crate) fn with_outcome(mut self, tx: oneshot::Sender<TransferOutcome>) -> Self {
        self.outcome = Some(tx);
        self
    }

    pub(crate) async fn run(mut self) {
        let outcome = self.drive().await;
        self.finish(outcome).await;
    }

    async fn drive(&mut self) -> TransferOutcome {
        let manifest = match self.acquire().await {
            Ok(Step::Next(manifest)) => manifest,
            Ok(Step::Stop(outcome)) => return outcome,
            Err(err) => return TransferOutcome::Failed(err),
        };
        if let Some(tx) = self.admission.take() {
            let _ = tx.send(Ok(manifest.clone()));
        }
        self.transfer(&manifest).await
    }

    async fn acquire(&mut self) -> Result<Step<ContentManifest>, TransferError> {
        let phase = match self.record.descriptor {
            ContentDescriptor::DirectFile(_) => TransferPhase::Probing,
            ContentDescriptor::PeerDiscovery(_) => TransferPhase::FetchingMetadata,
        };
        self.enter(phase).await;
        let heartbeat = Heartbeat {
            observer: self.ctx.observer.as_ref(),
            session_id: &self.record.session_id,
        };
        let probed = self
            .ctx
            .probe
            .resolve(
                &self.record.descriptor,
                self.ctx.probe_timeout,
                &self.cancel,
                Some(heartbeat),
            )
            .await?;
        let manifest = match probed {
            ProbeOutcome::Resolved(manifest) => manifest,
            ProbeOutcome::Cancelled => return Ok(Step::Stop(self.on_cancel(None).await)),
        };
        debug!(session = %self.record.session_id, manifest = %manifest.summary(), "metadata resolved");

        if self.skip_validation {
            debug!(session = %self.record.session_id, "validated before restart; skipping policy");
        } else {
            self.enter(TransferPhase::Validating).await;
            self.ctx.validator.check(&manifest)?;
        }

        if self.ctx.rename_on_redirect && manifest.display_name != self.record.display_name {
            info!(
                session = %self.record.session_id,
                from = %self.record.display_name,
                to = %manifest.display_name,
                "display name replaced by resolved title"
            );
            self.record.display_name = manifest.display_name.clone();
            self.ctx
                .active
                .set_display_name(&self.record.session_id, &manifest.display_name)
                .await;
        }
        Ok(Step::Next(manifest))
    }

    async fn transfer(&mut self, manifest: &ContentManifest) -> TransferOutcome {
        if self.cancel.is_cancelled() {
            return self.on_cancel(None).await;
        }
        self.enter(TransferPhase::Transferring).await;
        let params = AddParams::new(
            self.record.descriptor.add_source(),
            self.record.destination.clone(),
            AddMode::Transfer,
        );
        let handle = match self.ctx.session.add(params).await {
            Ok(handle) => handle,
            Err(err) => return TransferOutcome::Failed(err.into()),
        };
        info!(
            session = %self.record.session_id,
            %handle,
            destination = %self.record.destination.display(),
            size = manifest.total_size,
            "transfer started"
        );

        let mut throttle = ProgressThrottle::new(self.ctx.transfer.notify_min_interval());
        let mut ticker = interval(self.ctx.transfer.status_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // throttle against the tick schedule, not against when the status
            // call returned, so equal poll and notify intervals keep cadence
            let ticked = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.on_cancel(Some(handle)).await,
                at = ticker.tick() => at,
            };
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.on_cancel(Some(handle)).await,
                polled = self.ctx.session.status(handle) => polled,
            };
            let engine = match polled {
                Ok(status) => status,
                Err(err) => return self.engine_failed(handle, err.to_string()).await,
            };
            let status = TransferStatus::from_engine(&self.record.display_name, &engine);
            debug!(session = %self.record.session_id, "{}", status.line());

            if engine.state == EngineState::Error {
                let message = engine
                    .error
                    .unwrap_or_else(|| "engine reported an error".to_string());
                return self.engine_failed(handle, message).await;
            }
            if engine.state.is_complete() {
                return self.finalize(handle, status, &mut throttle).await;
            }
            if throttle.ready(ticked.into_std()) {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return self.on_cancel(Some(handle)).await,
                    _ = self.ctx.observer.progress(&self.record.session_id, &status) => {}
                }
            }
        }
    }

    async fn finalize(
        &mut self,
        handle: HandleId,
        status: TransferStatus,
        throttle: &mut ProgressThrottle,
    ) -> TransferOutcome {
        self.enter(TransferPhase::Finalizing).await;
        throttle.force(Instant::now().into_std());
        let final_status = TransferStatus {
            fraction_complete: 1.0,
            ..status
        };
        self.ctx
            .observer
            .progress(&self.record.session_id, &final_status)
            .await;
        if let Err(err) = self.ctx.session.pause(handle).await {
            warn!(session = %self.record.session_id, error = %err, "flush before release failed");
        }
        sleep(self.ctx.transfer.finalize_grace()).await;
        if let Err(err) = self.ctx.session.remove(handle, RemoveMode::KeepData).await {
            warn!(session = %self.record.session_id, error = %err, "release after completion failed");
        }
        if let Err(err) = self
            .ctx
            .notifier
            .notify_library_update(self.record.classification.kind)
            .await
        {
            warn!(session = %self.record.session_id, error = %err, "library refresh failed");
        }
        TransferOutcome::Completed {
            display_name: self.record.display_name.clone(),
            destination: self.record.destination.clone(),
        }
    }

    async fn engine_failed(&self, handle: HandleId, message: String) -> TransferOutcome {
        if let Err(err) = self.ctx.session.remove(handle, RemoveMode::KeepData).await {
            warn!(session = %self.record.session_id, error = %err, "release after engine failure failed");
        }
        TransferOutcome::Failed(TransferError::Engine(message))
    }

    /// The one place a cancellation is interpreted.
    async fn on_cancel(&self, handle: Option<HandleId>) -> TransferOutcome {
        let session = &self.record.session_id;
        match cancellation_behavior(self.ctx.shutdown.is_shutting_down()) {
            CancelAction::DeleteData => {
                if let Some(handle) = handle {
                    if let Err(err) = self.ctx.session.remove(handle, RemoveMode::DeleteData).await {
                        warn!(%session, error = %err, "removing cancelled transfer failed");
                    }
                }
                info!(%session, "transfer cancelled by user; partial data removed");
                TransferOutcome::Cancelled
            }
            CancelAction::PreserveData => {
                if let Some(handle) = handle {
                    if let Err(err) = self.ctx.session.pause(handle).await {
                        warn!(%session, error = %err, "flush before suspend failed");
                    }
                    if let Err(err) = self.ctx.session.remove(handle, RemoveMode::KeepData).await {
                        warn!(%session, error = %err, "releasing suspended transfer failed");
                    }
                }
                info!(%session, "transfer suspended for shutdown; partial data kept");
                TransferOutcome::Suspended
            }
        }
    }

    async fn enter(&mut self, phase: TransferPhase) {
        self.record.status = phase;
        debug!(session = %self.record.session_id, phase = phase.as_str(), "phase");
        if self.ctx.active.set_status(&self.record.session_id, phase).await {
            self.ctx.active.persist().await;
        }
        self.ctx.observer.phase(&self.record.session_id, phase).await;
    }

    async fn finish(mut self, outcome: TransferOutcome) {
        let session = self.record.session_id.clone();
        if let TransferOutcome::Failed(err) = &outcome {
            warn!(%session, kind = err.kind(), error = %err, "transfer failed");
        }
        if self.ctx.shutdown.is_shutting_down() {
            debug!(%session, outcome = outcome.as_str(), "shutting down; record kept for resume");
        } else {
            self.ctx.active.remove(&session).await;
            self.ctx.active.persist().await;
            if let Some(path) = &self.record.descriptor_path {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(%session, path = %path.display(), "descriptor file removed"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(%session, error = %err, "removing descriptor file failed"),
                }
            }
        }

        self.ctx.observer.finished(&session, &outcome).await;
        // a submitter still waiting hears about the refusal only after cleanup
        if let Some(tx) = self.admission.take() {
            let refused = match &outcome {
                TransferOutcome::Failed(err) => err.clone(),
                TransferOutcome::Cancelled => TransferError::Cancelled,
                TransferOutcome::Suspended => TransferError::ShuttingDown,
                TransferOutcome::Completed { .. } => {
                    TransferError::Engine("completed without admission".into())
                }
            };
            let _ = tx.send(Err(refused));
        }
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_and_cancelled_share_a_terminal_phase() {
        assert_eq!(TransferOutcome::Cancelled.phase(), TransferPhase::Cancelled);
        assert_eq!(TransferOutcome::Suspended.phase(), TransferPhase::Cancelled);
        assert_eq!(
            TransferOutcome::Failed(TransferError::ShuttingDown).phase(),
            TransferPhase::Failed
        );
    }

    #[test]
    fn outcome_messages_are_distinct() {
        let failed = TransferOutcome::Failed(TransferError::MetadataTimeout { secs: 120 });
        assert_eq!(failed.to_string(), "failed: metadata not available after 120s");
        assert!(TransferOutcome::Cancelled.to_string().contains("removed"));
        assert!(TransferOutcome::Suspended.to_string().contains("resume"));
    }
}
