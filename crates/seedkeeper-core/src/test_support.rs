use once_cell::sync::Lazy;
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::executor::TransferOutcome;
use crate::progress::{TransferObserver, TransferPhase, TransferStatus};

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) mod env {
    use super::*;

    pub(crate) struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: HashMap<String, Option<String>>,
    }

    pub(crate) fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
            saved: HashMap::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &str) {
            self.saved
                .entry(key.to_string())
                .or_insert_with(|| std::env::var(key).ok());
        }

        pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
            self.remember(key);
            std::env::set_var(key, value.as_ref());
        }

        pub(crate) fn remove(&mut self, key: &str) {
            self.remember(key);
            std::env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain() {
                match value {
                    Some(val) => std::env::set_var(&key, val),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Event {
    Progress(String, TransferStatus),
    Heartbeat(String, TransferPhase, Duration),
    Phase(String, TransferPhase),
    Finished(String, TransferOutcome),
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: PlMutex<Vec<Event>>,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn heartbeats(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Heartbeat(..)))
            .count()
    }

    pub(crate) fn progress(&self) -> Vec<TransferStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Progress(_, status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn phases(&self) -> Vec<TransferPhase> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Phase(_, phase) => Some(*phase),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TransferObserver for RecordingObserver {
    async fn progress(&self, session_id: &str, status: &TransferStatus) {
        self.events
            .lock()
            .push(Event::Progress(session_id.to_string(), status.clone()));
    }

    async fn heartbeat(&self, session_id: &str, phase: TransferPhase, elapsed: Duration) {
        self.events
            .lock()
            .push(Event::Heartbeat(session_id.to_string(), phase, elapsed));
    }

    async fn phase(&self, session_id: &str, phase: TransferPhase) {
        self.events
            .lock()
            .push(Event::Phase(session_id.to_string(), phase));
    }

    async fn finished(&self, session_id: &str, outcome: &TransferOutcome) {
        self.events
            .lock()
            .push(Event::Finished(session_id.to_string(), outcome.clone()));
    }
}
