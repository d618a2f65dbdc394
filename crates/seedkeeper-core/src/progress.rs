use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use seedkeeper_engine::{EngineState, EngineStatus};

use crate::executor::TransferOutcome;
use crate::units::human_rate;

/// Where a transfer is in its lifecycle. Persisted with the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Queued,
    Probing,
    FetchingMetadata,
    Validating,
    Transferring,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl TransferPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPhase::Queued => "queued",
            TransferPhase::Probing => "probing",
            TransferPhase::FetchingMetadata => "fetching_metadata",
            TransferPhase::Validating => "validating",
            TransferPhase::Transferring => "transferring",
            TransferPhase::Finalizing => "finalizing",
            TransferPhase::Completed => "completed",
            TransferPhase::Cancelled => "cancelled",
            TransferPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }

    /// Content was validated and handed to the engine at some point.
    pub fn passed_validation(&self) -> bool {
        matches!(self, TransferPhase::Transferring | TransferPhase::Finalizing)
    }
}

/// Progress snapshot handed to observers. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransferStatus {
    pub display_name: String,
    pub fraction_complete: f64,
    pub download_rate: u64,
    pub peer_count: u32,
    pub state: EngineState,
    pub total_done: u64,
    pub total_wanted: u64,
}

impl TransferStatus {
    pub fn from_engine(display_name: &str, status: &EngineStatus) -> Self {
        Self {
            display_name: display_name.to_string(),
            fraction_complete: status.progress.clamp(0.0, 1.0),
            download_rate: status.download_rate,
            peer_count: status.num_peers,
            state: status.state.clone(),
            total_done: status.total_done,
            total_wanted: status.total_wanted,
        }
    }

    pub fn percent(&self) -> f64 {
        self.fraction_complete * 100.0
    }

    pub fn line(&self) -> String {
        format!(
            "{}: {:.2}% | Peers: {} | Speed: {}",
            self.display_name,
            self.percent(),
            self.peer_count,
            human_rate(self.download_rate)
        )
    }
}

/// Receives lifecycle events for every transfer the supervisor runs.
///
/// Calls for one transfer are awaited in order and never overlap. They should
/// return promptly: a slow observer stalls that transfer's status loop.
#[async_trait]
pub trait TransferObserver: Send + Sync {
    async fn progress(&self, session_id: &str, status: &TransferStatus);

    /// Fired periodically while metadata is being fetched.
    async fn heartbeat(&self, _session_id: &str, _phase: TransferPhase, _elapsed: Duration) {}

    async fn phase(&self, _session_id: &str, _phase: TransferPhase) {}

    async fn finished(&self, session_id: &str, outcome: &TransferOutcome);
}

/// Observer that only writes log lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingObserver;

#[async_trait]
impl TransferObserver for LoggingObserver {
    async fn progress(&self, session_id: &str, status: &TransferStatus) {
        tracing::info!(session = %session_id, "{}", status.line());
    }

    async fn finished(&self, session_id: &str, outcome: &TransferOutcome) {
        tracing::info!(session = %session_id, outcome = outcome.as_str(), "{outcome}");
    }
}

/// Spaces out caller-visible progress notifications.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// True when enough time has passed since the last emitted update. The
    /// first call always passes.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Record an update that bypassed the interval check.
    pub fn force(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_suppresses_updates_inside_the_interval() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_secs(1)));
        assert!(!throttle.ready(start + Duration::from_millis(4999)));
        assert!(throttle.ready(start + Duration::from_secs(5)));
        throttle.force(start + Duration::from_secs(6));
        assert!(!throttle.ready(start + Duration::from_secs(7)));
    }

    #[test]
    fn ticks_on_the_notify_interval_all_pass() {
        let start = Instant::now();
        let every = Duration::from_secs(5);
        let mut throttle = ProgressThrottle::new(every);
        for n in 0..6 {
            assert!(throttle.ready(start + every * n), "tick {n}");
        }

        // jittered completion times would drop every other update
        let mut jittered = ProgressThrottle::new(every);
        assert!(jittered.ready(start + Duration::from_millis(300)));
        assert!(!jittered.ready(start + every + Duration::from_millis(100)));
    }

    #[test]
    fn zero_interval_never_throttles() {
        let now = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::ZERO);
        assert!(throttle.ready(now));
        assert!(throttle.ready(now));
    }

    #[test]
    fn phases_are_ordered_along_the_lifecycle() {
        assert!(TransferPhase::Queued < TransferPhase::Validating);
        assert!(TransferPhase::Validating < TransferPhase::Transferring);
        assert!(TransferPhase::Transferring.passed_validation());
        assert!(!TransferPhase::FetchingMetadata.passed_validation());
        assert!(TransferPhase::Cancelled.is_terminal());
        assert!(!TransferPhase::Finalizing.is_terminal());
    }

    #[test]
    fn status_line_matches_console_format() {
        let status = TransferStatus {
            display_name: "Film".into(),
            fraction_complete: 0.4231,
            download_rate: 2 * 1024 * 1024,
            peer_count: 7,
            state: EngineState::Downloading,
            total_done: 0,
            total_wanted: 0,
        };
        assert_eq!(status.line(), "Film: 42.31% | Peers: 7 | Speed: 2.00 MB/s");
    }
}
