use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TransferError;
use crate::persistence::{PersistenceStore, RecordMap, TransferRecord};
use crate::progress::TransferPhase;
use crate::shutdown::ShutdownFlag;

struct ActiveEntry {
    record: TransferRecord,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// In-memory set of live transfers, one per session. This is the source of
/// truth; the persistence store only mirrors it.
pub struct ActiveSet {
    entries: Mutex<HashMap<String, ActiveEntry>>,
    store: Option<PersistenceStore>,
    // serialises snapshot+write so the last write always carries the newest state
    persist_lock: Mutex<()>,
}

impl ActiveSet {
    pub fn new(store: Option<PersistenceStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store,
            persist_lock: Mutex::new(()),
        }
    }

    /// Register `record` and start its task.
    ///
    /// The shutdown check, duplicate check, spawn and insert happen under one
    /// lock, so a transfer can neither slip past a concurrent shutdown nor run
    /// twice for one session.
    pub async fn launch<F>(
        &self,
        record: TransferRecord,
        shutdown: &ShutdownFlag,
        spawn: F,
    ) -> Result<CancellationToken, TransferError>
    where
        F: FnOnce(CancellationToken) -> JoinHandle<()>,
    {
        let mut entries = self.entries.lock().await;
        if shutdown.is_shutting_down() {
            return Err(TransferError::ShuttingDown);
        }
        if entries.contains_key(&record.session_id) {
            return Err(TransferError::AlreadyActive(record.session_id));
        }
        let cancel = CancellationToken::new();
        let task = spawn(cancel.clone());
        entries.insert(
            record.session_id.clone(),
            ActiveEntry {
                record,
                cancel: cancel.clone(),
                task: Some(task),
            },
        );
        Ok(cancel)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.entries.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn record(&self, session_id: &str) -> Option<TransferRecord> {
        self.entries
            .lock()
            .await
            .get(session_id)
            .map(|e| e.record.clone())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self) -> RecordMap {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.record.clone()))
            .collect()
    }

    pub async fn set_status(&self, session_id: &str, status: TransferPhase) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(session_id) {
            Some(entry) => {
                entry.record.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn set_display_name(&self, session_id: &str, name: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(session_id) {
            entry.record.display_name = name.to_string();
        }
    }

    /// Drop the entry of a transfer that reached a terminal state.
    pub async fn remove(&self, session_id: &str) -> Option<TransferRecord> {
        self.entries
            .lock()
            .await
            .remove(session_id)
            .map(|e| e.record)
    }

    /// Signal one transfer to stop. Its entry stays until the task cleans up.
    pub async fn cancel(&self, session_id: &str) -> bool {
        match self.entries.lock().await.get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every transfer and hand back their tasks for joining. Records
    /// stay in place so the persisted file keeps them.
    pub async fn cancel_all(&self) -> Vec<(String, JoinHandle<()>)> {
        let mut entries = self.entries.lock().await;
        let mut tasks = Vec::new();
        for (id, entry) in entries.iter_mut() {
            entry.cancel.cancel();
            if let Some(task) = entry.task.take() {
                tasks.push((id.clone(), task));
            }
        }
        tasks
    }

    /// Write the current set to the store, if one is configured.
    pub async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot().await;
        store.save(&snapshot).await;
    }

    pub async fn load_persisted(&self) -> RecordMap {
        match &self.store {
            Some(store) => store.load().await,
            None => {
                warn!("no persistence store configured; nothing to resume");
                RecordMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ContentDescriptor;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(id: &str) -> TransferRecord {
        TransferRecord {
            session_id: id.into(),
            descriptor: ContentDescriptor::direct(b"d".to_vec()),
            destination: PathBuf::from("/tmp/x"),
            display_name: id.into(),
            classification: Default::default(),
            status: TransferPhase::Queued,
            descriptor_path: None,
            created_at: Utc::now(),
        }
    }

    fn idle(cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { cancel.cancelled().await })
    }

    #[tokio::test]
    async fn second_launch_for_a_session_is_rejected() {
        let set = ActiveSet::new(None);
        let flag = ShutdownFlag::new();
        set.launch(record("a"), &flag, idle).await.expect("first");
        let err = set.launch(record("a"), &flag, idle).await.expect_err("dup");
        assert_eq!(err, TransferError::AlreadyActive("a".into()));
        set.launch(record("b"), &flag, idle).await.expect("other session");
        assert_eq!(set.session_ids().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn launch_after_shutdown_never_spawns() {
        let set = ActiveSet::new(None);
        let flag = ShutdownFlag::new();
        flag.begin();
        let err = set
            .launch(record("a"), &flag, |_| panic!("must not spawn"))
            .await
            .expect_err("shutting down");
        assert_eq!(err, TransferError::ShuttingDown);
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn cancel_all_keeps_records_and_returns_tasks() {
        let set = ActiveSet::new(None);
        let flag = ShutdownFlag::new();
        let token = set.launch(record("a"), &flag, idle).await.expect("launch");
        let tasks = set.cancel_all().await;
        assert!(token.is_cancelled());
        assert_eq!(tasks.len(), 1);
        for (_, task) in tasks {
            task.await.expect("join");
        }
        assert!(set.contains("a").await);
        assert!(set.cancel_all().await.is_empty());
    }

    #[tokio::test]
    async fn persist_mirrors_status_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PersistenceStore::new(dir.path().join("active.json"));
        let set = ActiveSet::new(Some(store.clone()));
        let flag = ShutdownFlag::new();
        set.launch(record("a"), &flag, idle).await.expect("launch");
        set.set_status("a", TransferPhase::Transferring).await;
        set.persist().await;
        let loaded = store.load().await;
        assert_eq!(loaded["a"].status, TransferPhase::Transferring);

        set.remove("a").await;
        set.persist().await;
        assert!(store.load().await.is_empty());
    }
}
