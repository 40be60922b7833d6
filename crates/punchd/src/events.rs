//! Rate-limited event log.
//!
//! Each cycle is classified into zero or more event kinds; a kind is
//! persisted only if its own cooldown has elapsed since it was last
//! emitted.

use crate::config::EventCooldowns;
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use punch_core::KeyedThrottle;
use punch_hw::Frame;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Event,
    Detected,
    Recognized,
    MultiFace,
    AntiSpoof,
    GlassesDetected,
    CameraStart,
    CameraStop,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Event => "event",
            EventKind::Detected => "detected",
            EventKind::Recognized => "recognized",
            EventKind::MultiFace => "multi_face",
            EventKind::AntiSpoof => "anti_spoof",
            EventKind::GlassesDetected => "glasses_detected",
            EventKind::CameraStart => "camera_start",
            EventKind::CameraStop => "camera_stop",
        }
    }

    fn cooldown(&self, c: &EventCooldowns) -> Duration {
        match self {
            EventKind::Event => c.event,
            EventKind::Detected => c.detected,
            EventKind::Recognized => c.recognized,
            EventKind::MultiFace => c.multi_face,
            EventKind::AntiSpoof => c.anti_spoof,
            EventKind::GlassesDetected => c.glasses_detected,
            EventKind::CameraStart | EventKind::CameraStop => c.lifecycle,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub message: String,
    /// Snapshot saved alongside the event, if any.
    pub image_ref: Option<PathBuf>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// What one recognition cycle saw, as far as the event log cares.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub detected: usize,
    /// Accepted identities, in detection order.
    pub recognized: Vec<String>,
    pub spoof_suspected: bool,
}

pub struct EventClassifier {
    cooldowns: EventCooldowns,
    last: KeyedThrottle<EventKind>,
    store: Arc<dyn EventStore>,
    snapshot_dir: Option<PathBuf>,
}

impl EventClassifier {
    pub fn new(
        cooldowns: EventCooldowns,
        store: Arc<dyn EventStore>,
        snapshot_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            cooldowns,
            last: KeyedThrottle::new(),
            store,
            snapshot_dir,
        }
    }

    /// Classify one cycle with at least one face. Returns the kinds that
    /// were emitted.
    pub fn classify(&self, summary: &CycleSummary, frame: Option<&Frame>, now: Instant) -> Vec<EventKind> {
        let mut emitted = Vec::new();
        if summary.detected == 0 {
            return emitted;
        }

        let detected = summary.detected;
        let recognized = summary.recognized.len();

        if self.acquire(EventKind::Event, now) {
            self.emit(
                EventKind::Event,
                format!("Recognition event processed ({detected} face(s))"),
                None,
                serde_json::json!({ "detected": detected, "recognized": recognized }),
            );
            emitted.push(EventKind::Event);
        }

        if self.acquire(EventKind::Detected, now) {
            self.emit(
                EventKind::Detected,
                format!("Detected {detected} face(s)"),
                None,
                serde_json::json!({ "detected": detected }),
            );
            emitted.push(EventKind::Detected);
        }

        if recognized > 0 && self.acquire(EventKind::Recognized, now) {
            self.emit(
                EventKind::Recognized,
                format!("Recognized: {}", summary.recognized.join(", ")),
                None,
                serde_json::json!({ "recognized": recognized, "names": summary.recognized }),
            );
            emitted.push(EventKind::Recognized);
        }

        if detected > 1 && self.acquire(EventKind::MultiFace, now) {
            self.emit(
                EventKind::MultiFace,
                format!("Multiple faces detected ({detected})"),
                None,
                serde_json::json!({ "detected": detected }),
            );
            emitted.push(EventKind::MultiFace);
        }

        if summary.spoof_suspected && self.acquire(EventKind::AntiSpoof, now) {
            let image = frame.and_then(|f| self.save_snapshot(f, EventKind::AntiSpoof));
            self.emit(
                EventKind::AntiSpoof,
                "Spoof suspected".to_string(),
                image,
                serde_json::json!({ "detected": detected, "recognized": recognized }),
            );
            emitted.push(EventKind::AntiSpoof);
        }

        emitted
    }

    /// Registration-time eyeglasses hit. Returns true if it was logged.
    pub fn report_glasses_detected(&self, angle: Option<f32>, now: Instant) -> bool {
        if !self.acquire(EventKind::GlassesDetected, now) {
            return false;
        }
        self.emit(
            EventKind::GlassesDetected,
            "Glasses detected during registration".to_string(),
            None,
            serde_json::json!({ "angle": angle }),
        );
        true
    }

    /// Log a recognition start or stop.
    pub fn report_lifecycle(&self, started: bool, now: Instant) -> bool {
        let (kind, message) = if started {
            (EventKind::CameraStart, "Recognition started")
        } else {
            (EventKind::CameraStop, "Recognition stopped")
        };
        if !self.acquire(kind, now) {
            return false;
        }
        self.emit(kind, message.to_string(), None, serde_json::json!({}));
        true
    }

    pub fn reset(&self) {
        self.last.reset();
    }

    fn acquire(&self, kind: EventKind, now: Instant) -> bool {
        self.last.try_acquire(&kind, kind.cooldown(&self.cooldowns), now)
    }

    fn emit(&self, kind: EventKind, message: String, image_ref: Option<PathBuf>, metadata: serde_json::Value) {
        let record = EventRecord {
            kind,
            message,
            image_ref,
            metadata,
            timestamp: Utc::now(),
        };
        match self.store.write_event(&record) {
            Ok(()) => tracing::debug!(kind = kind.as_str(), message = %record.message, "event logged"),
            Err(e) => tracing::warn!(kind = kind.as_str(), error = %e, "failed to log event"),
        }
    }

    fn save_snapshot(&self, frame: &Frame, kind: EventKind) -> Option<PathBuf> {
        let dir = self.snapshot_dir.as_deref()?;
        match write_snapshot(dir, frame, kind) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), error = %e, "failed to save event snapshot");
                None
            }
        }
    }
}

fn write_snapshot(dir: &Path, frame: &Frame, kind: EventKind) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let name = format!(
        "{}_{}.png",
        kind.as_str(),
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let path = dir.join(name);
    let pixels = (frame.width * frame.height) as usize;
    let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data[..pixels].to_vec())
        .ok_or_else(|| anyhow::anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    img.save(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        events: Mutex<Vec<EventRecord>>,
    }

    impl RecordingStore {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    impl EventStore for RecordingStore {
        fn write_event(&self, event: &EventRecord) -> Result<(), StoreError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn classifier(store: Arc<RecordingStore>, snapshot_dir: Option<PathBuf>) -> EventClassifier {
        EventClassifier::new(EventCooldowns::default(), store, snapshot_dir)
    }

    fn summary(detected: usize, names: &[&str], spoof: bool) -> CycleSummary {
        CycleSummary {
            detected,
            recognized: names.iter().map(|n| n.to_string()).collect(),
            spoof_suspected: spoof,
        }
    }

    #[test]
    fn test_hundred_cycles_in_one_second_log_one_detected() {
        let store = Arc::new(RecordingStore::default());
        let c = classifier(store.clone(), None);
        let t0 = Instant::now();
        for i in 0..100 {
            c.classify(&summary(1, &[], false), None, t0 + Duration::from_millis(i * 10));
        }
        let detected = store.kinds().iter().filter(|k| **k == EventKind::Detected).count();
        assert_eq!(detected, 1);
    }

    #[test]
    fn test_no_faces_logs_nothing() {
        let store = Arc::new(RecordingStore::default());
        let c = classifier(store.clone(), None);
        assert!(c.classify(&summary(0, &[], false), None, Instant::now()).is_empty());
        assert!(store.kinds().is_empty());
    }

    #[test]
    fn test_kinds_and_messages() {
        let store = Arc::new(RecordingStore::default());
        let c = classifier(store.clone(), None);
        let emitted = c.classify(&summary(2, &["alice", "bob"], true), None, Instant::now());
        assert_eq!(
            emitted,
            vec![
                EventKind::Event,
                EventKind::Detected,
                EventKind::Recognized,
                EventKind::MultiFace,
                EventKind::AntiSpoof,
            ]
        );
        let events = store.events.lock().unwrap();
        assert_eq!(events[0].message, "Recognition event processed (2 face(s))");
        assert_eq!(events[2].message, "Recognized: alice, bob");
        assert_eq!(events[2].metadata["names"][1], "bob");
        assert_eq!(events[3].message, "Multiple faces detected (2)");
        assert!(events[4].image_ref.is_none());
    }

    #[test]
    fn test_cooldowns_are_per_kind() {
        let store = Arc::new(RecordingStore::default());
        let c = classifier(store.clone(), None);
        let t0 = Instant::now();
        c.classify(&summary(2, &[], false), None, t0);
        // detected re-arms after 5 s, multi_face only after 10 s
        let emitted = c.classify(&summary(2, &[], false), None, t0 + Duration::from_secs(6));
        assert_eq!(emitted, vec![EventKind::Event, EventKind::Detected]);
        let emitted = c.classify(&summary(2, &[], false), None, t0 + Duration::from_secs(10));
        assert_eq!(emitted, vec![EventKind::MultiFace]);
    }

    #[test]
    fn test_glasses_report_is_throttled() {
        let store = Arc::new(RecordingStore::default());
        let c = classifier(store.clone(), None);
        let t0 = Instant::now();
        assert!(c.report_glasses_detected(Some(12.5), t0));
        assert!(!c.report_glasses_detected(None, t0 + Duration::from_secs(9)));
        assert!(c.report_glasses_detected(None, t0 + Duration::from_secs(10)));
        assert_eq!(store.kinds(), vec![EventKind::GlassesDetected; 2]);
    }

    #[test]
    fn test_lifecycle_events() {
        let store = Arc::new(RecordingStore::default());
        let c = classifier(store.clone(), None);
        let t0 = Instant::now();
        assert!(c.report_lifecycle(true, t0));
        assert!(c.report_lifecycle(false, t0));
        assert!(!c.report_lifecycle(true, t0 + Duration::from_secs(1)));
        assert_eq!(store.kinds(), vec![EventKind::CameraStart, EventKind::CameraStop]);
    }

    #[test]
    fn test_anti_spoof_saves_snapshot() {
        let dir = std::env::temp_dir().join(format!("punch-events-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(RecordingStore::default());
        let c = classifier(store.clone(), Some(dir.clone()));
        let frame = Frame::new(vec![128; 16], 4, 4, 0).unwrap();

        c.classify(&summary(1, &[], true), Some(&frame), Instant::now());

        let events = store.events.lock().unwrap();
        let spoof = events.iter().find(|e| e.kind == EventKind::AntiSpoof).unwrap();
        let path = spoof.image_ref.as_ref().unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("anti_spoof_"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
