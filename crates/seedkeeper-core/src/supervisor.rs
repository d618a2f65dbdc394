use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seedkeeper_engine::{MagnetLink, TransferSession};

use crate::active::ActiveSet;
use crate::collab::{Collaborators, DiscoveryLinkExtractor, NameClassifier};
use crate::config::SupervisorConfig;
use crate::descriptor::ContentDescriptor;
use crate::error::TransferError;
use crate::executor::{ExecutorContext, TransferExecutor, TransferOutcome};
use crate::fetch::{is_descriptor_url, DescriptorFetcher, FetchError};
use crate::manifest::ContentManifest;
use crate::persistence::{PersistenceStore, TransferRecord};
use crate::placement::Placement;
use crate::policy::Rejection;
use crate::probe::{MetadataProbe, ProbeOutcome};
use crate::progress::{TransferObserver, TransferPhase};
use crate::session::SessionHandle;
use crate::shutdown::ShutdownFlag;

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub session_id: String,
    pub descriptor: ContentDescriptor,
    /// Fetched descriptor file to delete once the transfer is over.
    pub descriptor_file: Option<PathBuf>,
    pub display_name: Option<String>,
}

impl SubmitRequest {
    pub fn new(session_id: impl Into<String>, descriptor: ContentDescriptor) -> Self {
        Self {
            session_id: session_id.into(),
            descriptor,
            descriptor_file: None,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_descriptor_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor_file = Some(path.into());
        self
    }
}

/// Handed back once a transfer passed validation and was started.
#[derive(Debug)]
pub struct TransferTicket {
    pub session_id: String,
    pub manifest: ContentManifest,
    pub destination: PathBuf,
    outcome: oneshot::Receiver<TransferOutcome>,
}

impl TransferTicket {
    /// Wait for the transfer to end. `None` if the task was aborted.
    pub async fn outcome(self) -> Option<TransferOutcome> {
        self.outcome.await.ok()
    }
}

/// Owns the shared engine session and every transfer running on it.
pub struct Supervisor {
    ctx: Arc<ExecutorContext>,
    config: Arc<SupervisorConfig>,
    placement: Placement,
    classifier: Arc<dyn NameClassifier>,
    extractor: Arc<dyn DiscoveryLinkExtractor>,
    fetcher: DescriptorFetcher,
    drained: OnceCell<()>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        engine: Arc<dyn TransferSession>,
        observer: Arc<dyn TransferObserver>,
        collaborators: Collaborators,
    ) -> Result<Self, TransferError> {
        let session = SessionHandle::new(engine);
        let spool_dir = config.paths.spool_path();
        let store = PersistenceStore::new(config.paths.persistence_path());
        let probe = MetadataProbe::new(session.clone(), spool_dir.clone())
            .with_intervals(
                config.probe.poll_interval(),
                config.probe.heartbeat_interval(),
            );
        let ctx = ExecutorContext {
            session,
            observer,
            shutdown: ShutdownFlag::new(),
            active: Arc::new(ActiveSet::new(Some(store))),
            probe,
            validator: config.policy.validator(),
            transfer: config.transfer.clone(),
            probe_timeout: config.probe.timeout(),
            rename_on_redirect: config.titles.rename_on_redirect,
            notifier: collaborators.notifier,
        };
        let fetcher = DescriptorFetcher::new(&config.fetch, spool_dir)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            placement: Placement::from_paths(&config.paths),
            config: Arc::new(config),
            classifier: collaborators.classifier,
            extractor: collaborators.extractor,
            fetcher,
            drained: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.ctx.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.shutdown.is_shutting_down()
    }

    /// Start a transfer for `req.session_id`.
    ///
    /// Returns once the content passed validation and the engine took it over;
    /// probe, policy and admission failures come back as errors. Completion is
    /// reported to the observer and through the ticket.
    pub async fn submit(&self, req: SubmitRequest) -> Result<TransferTicket, TransferError> {
        let descriptor_file = req.descriptor_file.clone();
        let submitted = self.try_submit(req).await;
        if let (Err(PreAdmission(_)), Some(path)) = (&submitted, &descriptor_file) {
            discard_descriptor_file(path).await;
        }
        submitted.map_err(Into::into)
    }

    async fn try_submit(&self, req: SubmitRequest) -> Result<TransferTicket, SubmitFailure> {
        if self.is_shutting_down() {
            return Err(PreAdmission(TransferError::ShuttingDown));
        }
        let digest = req.descriptor.digest().map_err(PreAdmission)?;
        let display_name = req
            .display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| req.descriptor.display_hint())
            .unwrap_or_else(|| digest.clone());
        let classification = self.classifier.classify(&display_name);
        let destination = self.placement.destination(&classification);
        let record = TransferRecord {
            session_id: req.session_id.clone(),
            descriptor: req.descriptor,
            destination: destination.clone(),
            display_name,
            classification,
            status: TransferPhase::Queued,
            descriptor_path: req.descriptor_file,
            created_at: Utc::now(),
        };

        let (admit_tx, admit_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let ctx = Arc::clone(&self.ctx);
        let queued = record.clone();
        self.ctx
            .active
            .launch(record, &self.ctx.shutdown, move |cancel| {
                spawn_executor(
                    TransferExecutor::new(ctx, queued, cancel)
                        .with_admission(admit_tx)
                        .with_outcome(outcome_tx),
                )
            })
            .await
            .map_err(PreAdmission)?;
        self.ctx.active.persist().await;
        info!(session = %req.session_id, %digest, destination = %destination.display(), "transfer queued");

        match admit_rx.await {
            Ok(Ok(manifest)) => Ok(TransferTicket {
                session_id: req.session_id,
                manifest,
                destination,
                outcome: outcome_rx,
            }),
            Ok(Err(err)) => Err(Owned(err)),
            Err(_) => Err(Owned(TransferError::Engine(
                "transfer task ended before admission".into(),
            ))),
        }
    }

    /// Submit free-form input: a magnet link or an `http(s)` link to a
    /// descriptor file, which is fetched first.
    pub async fn submit_input(
        &self,
        session_id: &str,
        input: &str,
    ) -> Result<TransferTicket, TransferError> {
        let input = input.trim();
        let req = if MagnetLink::is_magnet(input) {
            SubmitRequest::new(session_id, ContentDescriptor::magnet(input)?)
        } else if is_descriptor_url(input) {
            let fetched = self
                .fetcher
                .fetch(input, session_id)
                .await
                .map_err(|err| match err {
                    FetchError::Invalid(msg) => TransferError::InvalidDescriptor(msg),
                    other => TransferError::Fetch(other),
                })?;
            SubmitRequest::new(session_id, ContentDescriptor::direct(fetched.bytes))
                .with_descriptor_file(fetched.spooled)
        } else {
            return Err(TransferError::InvalidDescriptor(format!(
                "expected a magnet link or a .torrent URL, got `{input}`"
            )));
        };
        self.submit(req).await
    }

    /// User abort: the transfer stops and its partial data is deleted.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let found = self.ctx.active.cancel(session_id).await;
        if found {
            info!(session = %session_id, "cancellation requested");
        }
        found
    }

    /// Relaunch every transfer left in the persistence file.
    pub async fn resume_persisted(&self) -> usize {
        let records = self.ctx.active.load_persisted().await;
        if records.is_empty() {
            return 0;
        }
        let mut resumed = 0;
        for (session_id, record) in records {
            let skip_validation = record.status.passed_validation();
            let ctx = Arc::clone(&self.ctx);
            let queued = record.clone();
            let launched = self
                .ctx
                .active
                .launch(record, &self.ctx.shutdown, move |cancel| {
                    spawn_executor(
                        TransferExecutor::new(ctx, queued, cancel).skip_validation(skip_validation),
                    )
                })
                .await;
            match launched {
                Ok(_) => {
                    info!(session = %session_id, skip_validation, "resuming transfer");
                    resumed += 1;
                }
                Err(err) => warn!(session = %session_id, error = %err, "cannot resume transfer"),
            }
        }
        resumed
    }

    /// Stop everything, keeping partial data and the persisted records.
    ///
    /// Order matters: the flag is raised before any task is cancelled, so no
    /// executor can read the old value and treat the stop as a user abort.
    ///
    /// Later and concurrent calls wait for the same drain to finish.
    pub async fn shutdown(&self) {
        self.drained.get_or_init(|| self.drain()).await;
    }

    async fn drain(&self) {
        if !self.ctx.shutdown.begin() {
            debug!("shutdown flag was already raised");
        }
        let tasks = self.ctx.active.cancel_all().await;
        info!(tasks = tasks.len(), "shutting down transfers");
        join_with_grace(tasks, self.config.shutdown.grace()).await;
        match self.ctx.session.close_if_idle().await {
            Ok(_) => {}
            Err(err) => warn!(error = %err, "closing engine session failed"),
        }
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.ctx.active.session_ids().await
    }

    pub async fn record(&self, session_id: &str) -> Option<TransferRecord> {
        self.ctx.active.record(session_id).await
    }

    /// Resolve and validate without starting a transfer.
    pub async fn inspect(
        &self,
        descriptor: &ContentDescriptor,
    ) -> Result<(ContentManifest, Option<Rejection>), TransferError> {
        let cancel = CancellationToken::new();
        match self
            .ctx
            .probe
            .resolve(descriptor, self.config.probe.quick_timeout(), &cancel, None)
            .await?
        {
            ProbeOutcome::Resolved(manifest) => {
                let verdict = self.ctx.validator.validate(&manifest);
                Ok((manifest, verdict))
            }
            ProbeOutcome::Cancelled => Err(TransferError::Cancelled),
        }
    }

    /// Magnet links found on `page_url` by the configured extractor.
    pub async fn discover(&self, page_url: &str) -> anyhow::Result<Vec<String>> {
        let mut seen = HashSet::new();
        Ok(self
            .extractor
            .extract(page_url)
            .await?
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| MagnetLink::parse(l).is_ok())
            .filter(|l| seen.insert(l.clone()))
            .collect())
    }
}

/// Where a submit failed: before an executor took the record over, or after,
/// in which case the executor already cleaned up after itself.
enum SubmitFailure {
    PreAdmission(TransferError),
    Owned(TransferError),
}

use SubmitFailure::{Owned, PreAdmission};

impl From<SubmitFailure> for TransferError {
    fn from(failure: SubmitFailure) -> Self {
        match failure {
            PreAdmission(err) | Owned(err) => err,
        }
    }
}

async fn discard_descriptor_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "descriptor file of refused submit removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "removing descriptor file failed"),
    }
}

fn spawn_executor(executor: TransferExecutor) -> JoinHandle<()> {
    tokio::spawn(executor.run())
}

async fn join_with_grace(tasks: Vec<(String, JoinHandle<()>)>, grace: Option<Duration>) {
    let deadline = grace.map(|g| tokio::time::Instant::now() + g);
    for (session, mut task) in tasks {
        let joined = match deadline {
            None => task.await,
            Some(deadline) => {
                tokio::select! {
                    res = &mut task => res,
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(%session, "transfer did not stop within the grace period; aborting");
                        task.abort();
                        task.await
                    }
                }
            }
        };
        if let Err(err) = joined {
            if !err.is_cancelled() {
                warn!(%session, error = %err, "transfer task ended abnormally");
            }
        }
    }
}
