#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use seedkeeper_core::config::SupervisorConfig;
use seedkeeper_core::{
    Collaborators, Supervisor, TransferObserver, TransferOutcome, TransferPhase, TransferStatus,
};
use seedkeeper_engine::metainfo::encode_descriptor;
use seedkeeper_mock_engine::{SimulatedSession, SimulationConfig};

pub const PAYLOAD: u64 = 400_000;
pub const STEP: u64 = 10_000;

pub fn test_config(root: &Path) -> SupervisorConfig {
    let mut cfg = SupervisorConfig::default();
    cfg.paths.state_dir = root.join("state");
    cfg.paths.download_dir = root.join("downloads");
    cfg.probe.timeout_secs = 5;
    cfg.probe.poll_interval_ms = 5;
    cfg.probe.heartbeat_interval_ms = 20;
    cfg.transfer.status_interval_ms = 5;
    cfg.transfer.notify_min_interval_ms = 0;
    cfg.transfer.finalize_grace_ms = 0;
    cfg.shutdown.grace_secs = 5;
    cfg
}

pub fn engine() -> Arc<SimulatedSession> {
    Arc::new(SimulatedSession::new(SimulationConfig {
        bytes_per_poll: STEP,
        metadata_polls: 2,
        peers: 5,
    }))
}

pub fn movie_descriptor(size: u64) -> Vec<u8> {
    encode_descriptor("movie.mkv", &[("movie.mkv", size)], 16384)
}

pub fn supervisor(
    cfg: SupervisorConfig,
    engine: &Arc<SimulatedSession>,
    observer: &Arc<Recorder>,
) -> Supervisor {
    Supervisor::new(cfg, engine.clone(), observer.clone(), Collaborators::default())
        .expect("supervisor")
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let waited = timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

pub fn downloads(root: &Path) -> PathBuf {
    root.join("downloads")
}

#[derive(Default)]
pub struct Recorder {
    progress: Mutex<Vec<(String, TransferStatus)>>,
    phases: Mutex<Vec<(String, TransferPhase)>>,
    heartbeats: Mutex<usize>,
    finished: Mutex<Vec<(String, TransferOutcome)>>,
    changed: Notify,
}

impl Recorder {
    pub fn phases_for(&self, session: &str) -> Vec<TransferPhase> {
        self.phases
            .lock()
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, p)| *p)
            .collect()
    }

    pub fn progress_for(&self, session: &str) -> Vec<TransferStatus> {
        self.progress
            .lock()
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        *self.heartbeats.lock()
    }

    pub fn outcome_for(&self, session: &str) -> Option<TransferOutcome> {
        self.finished
            .lock()
            .iter()
            .find(|(s, _)| s == session)
            .map(|(_, o)| o.clone())
    }

    pub async fn wait_finished(&self, session: &str) -> TransferOutcome {
        let found = timeout(Duration::from_secs(10), async {
            loop {
                let notified = self.changed.notified();
                if let Some(outcome) = self.outcome_for(session) {
                    return outcome;
                }
                notified.await;
            }
        })
        .await;
        found.expect("transfer did not finish in time")
    }

    pub async fn wait_phase(&self, session: &str, phase: TransferPhase) {
        let reached = timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.changed.notified();
                if self.phases_for(session).contains(&phase) {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(reached.is_ok(), "{session} never reached {phase:?}");
    }
}

#[async_trait]
impl TransferObserver for Recorder {
    async fn progress(&self, session_id: &str, status: &TransferStatus) {
        self.progress
            .lock()
            .push((session_id.to_string(), status.clone()));
        self.changed.notify_waiters();
    }

    async fn heartbeat(&self, _session_id: &str, _phase: TransferPhase, _elapsed: Duration) {
        *self.heartbeats.lock() += 1;
        self.changed.notify_waiters();
    }

    async fn phase(&self, session_id: &str, phase: TransferPhase) {
        self.phases.lock().push((session_id.to_string(), phase));
        self.changed.notify_waiters();
    }

    async fn finished(&self, session_id: &str, outcome: &TransferOutcome) {
        self.finished
            .lock()
            .push((session_id.to_string(), outcome.clone()));
        self.changed.notify_waiters();
    }
}

/// Serve `body` over plain HTTP to every request until the test ends.
/// Returns the base URL.
pub async fn serve_descriptor(body: Vec<u8>) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/x-bittorrent\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = conn.write_all(head.as_bytes()).await;
                let _ = conn.write_all(&body).await;
                let _ = conn.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

pub fn spooled_files(cfg: &SupervisorConfig) -> Vec<PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(cfg.paths.spool_path())
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default();
    files.sort();
    files
}
