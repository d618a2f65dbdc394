use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide shutdown mode, shared by the supervisor and every executor.
///
/// Executors read it at the moment they observe cancellation, never earlier.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter shutdown mode. Returns false if it was already set.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelAction {
    /// User abort: drop the registration together with any partial data.
    DeleteData,
    /// Process exit: keep partial data and the record so the transfer resumes.
    PreserveData,
}

/// Decide what a cancellation means. Call exactly once per cancellation event,
/// with the flag value read at that moment.
pub fn cancellation_behavior(is_shutting_down: bool) -> CancelAction {
    if is_shutting_down {
        CancelAction::PreserveData
    } else {
        CancelAction::DeleteData
    }
}
