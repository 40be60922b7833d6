//! The recognition pipeline as seen from the control surface: scheduler
//! and watchdog lifecycle, stream subscriptions, roster reloads and status.

use crate::hub::{BroadcastHub, Subscriber};
use crate::messages::{FaceReport, StatusSnapshot};
use crate::scheduler::{Diagnostics, PipelineError, Scheduler, Shared};
use crate::watchdog::{Supervised, Watchdog};
use punch_core::{Roster, RosterEntry, RosterError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("no roster file configured")]
    NoRosterFile,
    #[error("failed to read roster {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Roster(#[from] RosterError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub version: &'static str,
    pub recognition_active: bool,
    pub worker_running: bool,
    pub watchdog_running: bool,
    pub source_active: bool,
    pub roster_entries: usize,
    pub roster_identities: usize,
    pub subscribers: usize,
    pub buffered_frames: usize,
    pub heartbeat_age_ms: u64,
    pub uptime_secs: u64,
    pub diagnostics: Diagnostics,
}

pub struct RecognitionPipeline {
    scheduler: Arc<Scheduler>,
    watchdog: Arc<Watchdog>,
    roster_path: Option<PathBuf>,
    started_at: Instant,
}

impl RecognitionPipeline {
    pub fn new(shared: Arc<Shared>, roster_path: Option<PathBuf>) -> Self {
        let watchdog_options = shared.options.watchdog.clone();
        let scheduler = Arc::new(Scheduler::new(shared));
        let watchdog = Arc::new(Watchdog::new(
            Arc::clone(&scheduler) as Arc<dyn Supervised>,
            watchdog_options,
        ));
        Self {
            scheduler,
            watchdog,
            roster_path,
            started_at: Instant::now(),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        self.scheduler.shared()
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.shared().hub
    }

    /// Start the worker and its watchdog. Returns false if already running.
    pub fn start(&self) -> Result<bool, PipelineError> {
        let started = self.scheduler.start()?;
        self.watchdog.start()?;
        if started {
            tracing::info!("recognition started");
            self.shared().events.report_lifecycle(true, Instant::now());
        }
        Ok(started)
    }

    /// Stop the watchdog first so it cannot resurrect the worker.
    pub fn stop(&self) -> bool {
        self.watchdog.stop();
        let stopped = self.scheduler.stop();
        if stopped {
            tracing::info!("recognition stopped");
            self.shared().events.report_lifecycle(false, Instant::now());
        }
        stopped
    }

    pub fn subscribe(&self) -> Subscriber {
        self.hub().subscribe(self.status_snapshot())
    }

    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        self.hub().unsubscribe(subscriber);
    }

    pub fn latest_results(&self) -> Vec<FaceReport> {
        self.shared().latest_results()
    }

    /// Validate and swap in a new roster. Cycles already running keep the
    /// old one.
    pub fn reload_roster(&self, entries: Vec<RosterEntry>) -> Result<usize, RosterError> {
        Ok(self.install_roster(Roster::try_new(entries)?))
    }

    /// Re-read the configured roster file.
    pub fn reload_roster_from_file(&self) -> Result<usize, ReloadError> {
        let path = self.roster_path.as_ref().ok_or(ReloadError::NoRosterFile)?;
        Ok(self.install_roster(load_roster(path)?))
    }

    fn install_roster(&self, roster: Roster) -> usize {
        let (entries, identities) = (roster.len(), roster.identity_count());
        let previous = self.shared().roster.replace(roster);
        tracing::info!(entries, identities, previous = previous.len(), "roster reloaded");
        entries
    }

    pub fn report_glasses_detected(&self, angle: Option<f32>) -> bool {
        self.shared().events.report_glasses_detected(angle, Instant::now())
    }

    /// The snapshot a new subscriber receives.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::new(
            self.latest_results(),
            self.shared().source.is_active(),
            self.started_at.elapsed().as_secs(),
        )
    }

    pub fn status(&self) -> PipelineStatus {
        let shared = self.shared();
        let roster = shared.roster.snapshot();
        PipelineStatus {
            version: env!("CARGO_PKG_VERSION"),
            recognition_active: self.scheduler.is_active(),
            worker_running: self.scheduler.is_running(),
            watchdog_running: self.watchdog.is_running(),
            source_active: shared.source.is_active(),
            roster_entries: roster.len(),
            roster_identities: roster.identity_count(),
            subscribers: shared.hub.subscriber_count(),
            buffered_frames: shared.buffer.len(),
            heartbeat_age_ms: shared.heartbeat.age(Instant::now()).as_millis() as u64,
            uptime_secs: self.started_at.elapsed().as_secs(),
            diagnostics: shared.diagnostics(),
        }
    }
}

/// Read and validate a JSON roster file.
pub fn load_roster(path: &Path) -> Result<Roster, ReloadError> {
    let json = std::fs::read_to_string(path).map_err(|source| ReloadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Roster::from_json(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::fixture;

    fn pipeline(roster_path: Option<PathBuf>) -> RecognitionPipeline {
        RecognitionPipeline::new(fixture().shared, roster_path)
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let p = pipeline(None);
        assert!(p.start().unwrap());
        assert!(!p.start().unwrap());
        let status = p.status();
        assert!(status.recognition_active);
        assert!(status.watchdog_running);
        assert!(p.stop());
        assert!(!p.stop());
        let status = p.status();
        assert!(!status.recognition_active);
        assert!(!status.watchdog_running);
    }

    #[tokio::test]
    async fn test_subscribe_gets_status_snapshot() {
        let p = pipeline(None);
        let mut sub = p.subscribe();
        assert_eq!(sub.recv().await.unwrap().kind(), "connection");
        assert_eq!(sub.recv().await.unwrap().kind(), "status");
        assert_eq!(p.status().subscribers, 1);
        p.unsubscribe(&sub);
        assert_eq!(p.status().subscribers, 0);
    }

    #[test]
    fn test_reload_roster_swaps_entries() {
        let p = pipeline(None);
        assert_eq!(p.status().roster_identities, 2);
        let n = p
            .reload_roster(vec![
                RosterEntry::new("carol", vec![1.0]),
                RosterEntry::new("carol", vec![1.1]),
            ])
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(p.status().roster_identities, 1);
    }

    #[test]
    fn test_reload_rejects_mixed_dimensions_and_keeps_old_roster() {
        let p = pipeline(None);
        let err = p
            .reload_roster(vec![
                RosterEntry::new("carol", vec![1.0, 0.0]),
                RosterEntry::new("dave", vec![1.0]),
            ])
            .unwrap_err();
        assert!(matches!(err, RosterError::DimensionMismatch { index: 1, .. }));
        assert_eq!(p.status().roster_identities, 2);
    }

    #[test]
    fn test_reload_from_file() {
        let path = std::env::temp_dir().join(format!("punch-roster-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"[{"identity":"dave","embedding":[0.1,0.2]}]"#).unwrap();
        let p = pipeline(Some(path.clone()));
        assert_eq!(p.reload_roster_from_file().unwrap(), 1);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(p.reload_roster_from_file(), Err(ReloadError::Read { .. })));
        assert!(matches!(pipeline(None).reload_roster_from_file(), Err(ReloadError::NoRosterFile)));
    }

    #[test]
    fn test_report_glasses_detected_throttled() {
        let p = pipeline(None);
        assert!(p.report_glasses_detected(Some(10.0)));
        assert!(!p.report_glasses_detected(None));
    }
}
