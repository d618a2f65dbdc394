//! Async face of the shared engine session.
//!
//! Every engine call can block, so each one runs on tokio's blocking pool and
//! the caller's task stays free to observe cancellation and timers.

use std::sync::Arc;

use tracing::{info, warn};

use seedkeeper_engine::{
    AddParams, EngineError, EngineStatus, HandleId, Metainfo, RemoveMode, TransferSession,
};

#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<dyn TransferSession>,
}

impl SessionHandle {
    pub fn new(session: Arc<dyn TransferSession>) -> Self {
        Self { inner: session }
    }

    pub fn id(&self) -> &'static str {
        self.inner.id()
    }

    async fn call<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TransferSession) -> Result<T, EngineError> + Send + 'static,
    {
        let session = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(session.as_ref()))
            .await
            .map_err(|err| EngineError::Internal(format!("engine call aborted: {err}")))?
    }

    pub async fn add(&self, params: AddParams) -> Result<HandleId, EngineError> {
        self.call(move |s| s.add(params)).await
    }

    pub async fn status(&self, handle: HandleId) -> Result<EngineStatus, EngineError> {
        self.call(move |s| s.status(handle)).await
    }

    pub async fn metainfo(&self, handle: HandleId) -> Result<Option<Metainfo>, EngineError> {
        self.call(move |s| s.metainfo(handle)).await
    }

    pub async fn pause(&self, handle: HandleId) -> Result<(), EngineError> {
        self.call(move |s| s.pause(handle)).await
    }

    pub async fn remove(&self, handle: HandleId, mode: RemoveMode) -> Result<(), EngineError> {
        self.call(move |s| s.remove(handle, mode)).await
    }

    pub async fn registered(&self) -> usize {
        self.call(|s| Ok(s.registered())).await.unwrap_or(0)
    }

    /// Close the engine session, but only once nothing is registered with it.
    /// Returns whether the session was closed.
    pub(crate) async fn close_if_idle(&self) -> Result<bool, EngineError> {
        let remaining = self.call(|s| Ok(s.registered())).await?;
        if remaining > 0 {
            warn!(
                engine = self.id(),
                remaining, "engine session still holds registrations; leaving it open"
            );
            return Ok(false);
        }
        self.call(|s| s.shutdown()).await?;
        info!(engine = self.id(), "engine session closed");
        Ok(true)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("engine", &self.inner.id())
            .finish()
    }
}
