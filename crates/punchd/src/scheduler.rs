//! Recognition worker.
//!
//! One named OS thread pulls the newest frame at a bounded rate, matches
//! every face against the roster and hands the results to attendance, the
//! event log and the broadcast hub. Each iteration is isolated: an error or
//! a panic is logged, backed off, and the loop carries on.

use crate::attendance::{AttendanceGate, GateOutcome};
use crate::config::{RecognitionOptions, SchedulerOptions};
use crate::events::{CycleSummary, EventClassifier};
use crate::hub::BroadcastHub;
use crate::load::LoadProbe;
use crate::messages::{AttendanceFields, FacePayload, FaceReport, RecognizedPerson, StreamMessage};
use chrono::Utc;
use punch_core::{
    AttributeAnalyzer, EmbedderError, FaceAttributes, FaceEmbedder, Matcher, RosterHandle,
    SpoofCheck, Throttle,
};
use punch_hw::{FrameBuffer, FrameSource};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no frame available")]
    NoFrame,
    #[error("face detection failed: {0}")]
    Detection(#[from] EmbedderError),
    #[error("recognition cycle panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn recognition thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl PipelineError {
    /// How long the worker pauses before the next iteration.
    pub fn backoff(&self, options: &SchedulerOptions) -> Duration {
        match self {
            PipelineError::NoFrame => options.capture_retry,
            PipelineError::Detection(_) => options.detect_backoff,
            PipelineError::Panicked(_) | PipelineError::Spawn(_) => options.error_backoff,
        }
    }
}

/// Liveness stamp written at the top of every worker iteration.
#[derive(Debug)]
pub struct Heartbeat {
    last: Mutex<Instant>,
}

impl Heartbeat {
    pub fn new(now: Instant) -> Self {
        Self {
            last: Mutex::new(now),
        }
    }

    /// Record liveness at `now`. Never moves backwards.
    pub fn beat(&self, now: Instant) {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        *last = (*last).max(now);
    }

    pub fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last())
    }
}

/// Where the frame of the latest pass came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOrigin {
    Buffer,
    Source,
    None,
}

impl FrameOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            FrameOrigin::Buffer => "buffer",
            FrameOrigin::Source => "source",
            FrameOrigin::None => "none",
        }
    }
}

/// Counters surfaced by `Status()`.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub frame_source: FrameOrigin,
    pub consecutive_misses: u32,
    pub last_face_count: usize,
    pub load_high: bool,
    pub full_passes: u64,
    pub errors: u64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            frame_source: FrameOrigin::None,
            consecutive_misses: 0,
            last_face_count: 0,
            load_high: false,
            full_passes: 0,
            errors: 0,
        }
    }
}

/// Everything a worker iteration reads or writes. Built once, shared by
/// every worker generation.
pub struct Shared {
    pub source: Arc<dyn FrameSource>,
    pub buffer: Arc<FrameBuffer>,
    pub embedder: Arc<dyn FaceEmbedder>,
    /// Present when age or emotion estimation is enabled.
    pub attributes: Option<Arc<dyn AttributeAnalyzer>>,
    /// Present when spoof checks are enabled.
    pub spoof: Option<Arc<dyn SpoofCheck>>,
    pub load: Arc<dyn LoadProbe>,
    pub matcher: Box<dyn Matcher>,
    pub roster: Arc<RosterHandle>,
    pub gate: AttendanceGate,
    pub events: EventClassifier,
    pub hub: Arc<BroadcastHub>,
    pub options: RecognitionOptions,
    pub heartbeat: Heartbeat,
    latest: Mutex<Vec<FaceReport>>,
    diagnostics: Mutex<Diagnostics>,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn FrameSource>,
        buffer: Arc<FrameBuffer>,
        embedder: Arc<dyn FaceEmbedder>,
        attributes: Option<Arc<dyn AttributeAnalyzer>>,
        spoof: Option<Arc<dyn SpoofCheck>>,
        load: Arc<dyn LoadProbe>,
        matcher: Box<dyn Matcher>,
        roster: Arc<RosterHandle>,
        gate: AttendanceGate,
        events: EventClassifier,
        hub: Arc<BroadcastHub>,
        options: RecognitionOptions,
    ) -> Self {
        Self {
            source,
            buffer,
            embedder,
            attributes,
            spoof,
            load,
            matcher,
            roster,
            gate,
            events,
            hub,
            options,
            heartbeat: Heartbeat::new(Instant::now()),
            latest: Mutex::new(Vec::new()),
            diagnostics: Mutex::new(Diagnostics::default()),
        }
    }

    pub fn latest_results(&self) -> Vec<FaceReport> {
        self.latest.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_latest(&self, results: Vec<FaceReport>) {
        *self.latest.lock().unwrap_or_else(|p| p.into_inner()) = results;
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn update_diagnostics(&self, f: impl FnOnce(&mut Diagnostics)) {
        f(&mut self.diagnostics.lock().unwrap_or_else(|p| p.into_inner()));
    }

    /// Clear results and counters.
    pub fn reset(&self) {
        self.set_latest(Vec::new());
        *self.diagnostics.lock().unwrap_or_else(|p| p.into_inner()) = Diagnostics::default();
    }
}

/// Per-worker loop state. A restarted worker starts from scratch.
pub struct CycleState {
    last_cycle_at: Option<Instant>,
    last_load_check: Option<Instant>,
    /// `(sequence, timestamp)` of the last buffered frame handed to a pass.
    last_frame: Option<(u32, Instant)>,
    load_high: bool,
    misses: u32,
    empty_broadcast: Throttle,
    attribute_throttle: Throttle,
    spoof_throttle: Throttle,
    debug_log: Throttle,
}

impl CycleState {
    pub fn new(options: &RecognitionOptions) -> Self {
        Self {
            last_cycle_at: None,
            last_load_check: None,
            last_frame: None,
            load_high: false,
            misses: 0,
            empty_broadcast: Throttle::new(options.scheduler.empty_broadcast_interval),
            attribute_throttle: Throttle::new(options.analyzers.attribute_interval),
            spoof_throttle: Throttle::new(options.analyzers.spoof_interval),
            debug_log: Throttle::new(options.scheduler.debug_log_interval),
        }
    }

    pub fn last_cycle_at(&self) -> Option<Instant> {
        self.last_cycle_at
    }

    fn debug_summary(&self, now: Instant, origin: FrameOrigin, faces: usize) {
        if self.debug_log.try_acquire(now) {
            tracing::debug!(
                frame_source = origin.as_str(),
                misses = self.misses,
                faces,
                load_high = self.load_high,
                "recognition summary"
            );
        }
    }
}

/// One worker iteration. Returns how long to sleep before the next one.
pub fn run_once(shared: &Shared, state: &mut CycleState, now: Instant) -> Result<Duration, PipelineError> {
    let opts = &shared.options.scheduler;
    shared.heartbeat.beat(now);

    let load_due = state
        .last_load_check
        .map_or(true, |t| now.saturating_duration_since(t) >= opts.load_poll_interval);
    if load_due {
        state.load_high = shared.load.is_high();
        state.last_load_check = Some(now);
    }

    let since_last = state.last_cycle_at.map(|t| now.saturating_duration_since(t));
    if state.load_high
        && since_last.is_some_and(|d| d < opts.cycle_interval.max(opts.load_min_interval))
    {
        return Ok(opts.load_backoff);
    }
    if since_last.is_some_and(|d| d < opts.cycle_interval) {
        return Ok(opts.retry_sleep);
    }

    // A buffered frame is consumed by one pass only; a frozen buffer falls
    // through to the source and counts as a miss there.
    let fresh = shared
        .buffer
        .latest()
        .filter(|f| state.last_frame != Some((f.sequence, f.timestamp)));
    let (frame, origin) = match fresh {
        Some(frame) => {
            state.last_frame = Some((frame.sequence, frame.timestamp));
            (frame, FrameOrigin::Buffer)
        }
        None => match shared.source.read_frame() {
            Some(frame) => (Arc::new(frame), FrameOrigin::Source),
            None => {
                state.misses += 1;
                if state.misses >= opts.reinit_after_misses {
                    tracing::warn!(misses = state.misses, "no frames, reinitializing source");
                    let ok = shared.source.reinitialize();
                    tracing::info!(ok, "frame source reinitialized");
                    state.misses = 0;
                }
                let misses = state.misses;
                shared.update_diagnostics(|d| {
                    d.frame_source = FrameOrigin::None;
                    d.consecutive_misses = misses;
                });
                state.debug_summary(now, FrameOrigin::None, 0);
                return Err(PipelineError::NoFrame);
            }
        },
    };
    state.misses = 0;

    let detections = shared
        .embedder
        .detect_and_embed(&frame.data, frame.width, frame.height)?;
    shared.heartbeat.beat(Instant::now());
    state.last_cycle_at = Some(now);
    state.debug_summary(now, origin, detections.len());

    let face_count = if opts.multi_face { detections.len() } else { detections.len().min(1) };
    let load_high = state.load_high;
    shared.update_diagnostics(|d| {
        d.frame_source = origin;
        d.consecutive_misses = 0;
        d.last_face_count = face_count;
        d.load_high = load_high;
        d.full_passes += 1;
    });

    let (stream_w, stream_h) = (opts.stream_width, opts.stream_height);
    if detections.is_empty() {
        shared.set_latest(Vec::new());
        if state.empty_broadcast.try_acquire(now) {
            shared.hub.publish(StreamMessage::face_detected(Vec::new(), stream_w, stream_h));
        }
        return Ok(opts.idle_sleep);
    }

    let roster = shared.roster.snapshot();
    let policy = &shared.options.matching;
    let spoof_due = shared.spoof.is_some() && state.spoof_throttle.try_acquire(now);
    let sx = if frame.width > 0 { stream_w as f32 / frame.width as f32 } else { 1.0 };
    let sy = if frame.height > 0 { stream_h as f32 / frame.height as f32 } else { 1.0 };

    let mut reports = Vec::with_capacity(face_count);
    let mut payloads = Vec::with_capacity(face_count);
    for (face_id, det) in detections.iter().take(face_count).enumerate() {
        let result = shared.matcher.decide(&det.embedding, &roster);
        let confidence = policy.display_confidence(result.confidence_raw);

        let attrs = match &shared.attributes {
            Some(analyzer) if state.attribute_throttle.try_acquire(now) => {
                let attrs = analyzer
                    .analyze(&frame.data, frame.width, frame.height, &det.bbox)
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "attribute analysis failed");
                        FaceAttributes::default()
                    });
                shared.heartbeat.beat(Instant::now());
                attrs
            }
            _ => FaceAttributes::default(),
        };
        let verdict = match (&shared.spoof, spoof_due) {
            (Some(check), true) => {
                let verdict = check.check(&frame.data, frame.width, frame.height, &det.bbox);
                shared.heartbeat.beat(Instant::now());
                verdict
            }
            _ => None,
        };

        if let Some(rejection) = result.rejection {
            tracing::trace!(?rejection, distance = ?result.distance, margin = ?result.margin, "face not matched");
        }

        let scaled = det.bbox.scaled(sx, sy);
        payloads.push(FacePayload {
            x: scaled.x as i32,
            y: scaled.y as i32,
            width: scaled.width as i32,
            height: scaled.height as i32,
            confidence,
            recognized: result.is_match(),
            name: result.identity.label().to_string(),
            age: attrs.age,
            emotion: attrs.emotion.clone(),
            spoof: verdict.map(|v| v.is_spoof),
        });
        reports.push(FaceReport {
            face_id,
            name: result.identity.label().to_string(),
            recognized: result.is_match(),
            distance: result.distance,
            confidence_raw: result.confidence_raw,
            confidence,
            location: det.bbox,
            spoof: verdict.map(|v| v.is_spoof),
            spoof_score: verdict.map(|v| v.score),
            age: attrs.age,
            emotion: attrs.emotion,
            timestamp: Utc::now(),
        });
    }

    shared.set_latest(reports.clone());

    let summary = CycleSummary {
        detected: reports.len(),
        recognized: reports.iter().filter(|r| r.recognized).map(|r| r.name.clone()).collect(),
        spoof_suspected: reports.iter().any(|r| r.spoof == Some(true)),
    };
    shared.events.classify(&summary, Some(&frame), now);

    let first_recognized = reports.iter().position(|r| r.recognized);
    let mut first_attendance: Option<AttendanceFields> = None;
    let mut duplicates = Vec::new();
    for (idx, report) in reports.iter().enumerate().filter(|(_, r)| r.recognized) {
        match shared.gate.process(&report.name, report.confidence, report.confidence_raw, now) {
            GateOutcome::Recorded(fields) if Some(idx) == first_recognized => {
                first_attendance = Some(fields);
            }
            GateOutcome::Recorded(_) | GateOutcome::Suppressed => {}
            GateOutcome::Duplicate(msg) => duplicates.push(msg),
        }
    }

    shared.hub.publish(StreamMessage::face_detected(payloads, stream_w, stream_h));
    if let Some(first) = first_recognized.map(|i| &reports[i]) {
        shared.hub.publish(StreamMessage::PersonRecognized {
            timestamp: first.timestamp,
            data: RecognizedPerson {
                name: first.name.clone(),
                confidence: first.confidence,
                attendance: first_attendance,
            },
        });
    }
    for msg in duplicates {
        shared.hub.publish(msg);
    }

    Ok(opts.active_sleep)
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_live(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

/// Owns the worker thread and its lifecycle.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    active: AtomicBool,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            worker: Mutex::new(None),
            active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Whether recognition is meant to be running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether a worker thread is currently alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(Worker::is_live)
    }

    /// Start a worker. Returns `Ok(false)` if one is already live.
    pub fn start(&self) -> Result<bool, PipelineError> {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.as_ref().is_some_and(Worker::is_live) {
            return Ok(false);
        }
        *worker = Some(self.spawn_worker()?);
        self.active.store(true, Ordering::Release);
        Ok(true)
    }

    /// Stop the worker, waiting up to the join timeout before detaching it.
    /// Returns false if no worker was running.
    pub fn stop(&self) -> bool {
        self.active.store(false, Ordering::Release);
        let Some(worker) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return false;
        };
        worker.running.store(false, Ordering::Release);

        let deadline = Instant::now() + self.shared.options.scheduler.join_timeout;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if worker.handle.is_finished() {
            let _ = worker.handle.join();
            tracing::info!("recognition worker stopped");
        } else {
            tracing::warn!("recognition worker did not exit in time, detaching");
        }
        true
    }

    /// Replace the current worker without waiting for it. The old thread
    /// exits at its next loop check.
    pub fn restart(&self) -> Result<(), PipelineError> {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = worker.take() {
            old.running.store(false, Ordering::Release);
        }
        *worker = Some(self.spawn_worker()?);
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn spawn_worker(&self) -> Result<Worker, PipelineError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let running = Arc::new(AtomicBool::new(true));
        self.shared.heartbeat.beat(Instant::now());

        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("punch-recognition-{generation}"))
            .spawn(move || worker_loop(shared, flag))?;

        tracing::info!(generation, "recognition worker started");
        Ok(Worker { running, handle })
    }
}

fn worker_loop(shared: Arc<Shared>, running: Arc<AtomicBool>) {
    let mut state = CycleState::new(&shared.options);
    let opts = &shared.options.scheduler;

    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| run_once(&shared, &mut state, now)));
        let error = match outcome {
            Ok(Ok(pause)) => {
                std::thread::sleep(pause);
                continue;
            }
            Ok(Err(e)) => e,
            Err(payload) => PipelineError::Panicked(panic_message(payload.as_ref())),
        };

        match &error {
            PipelineError::NoFrame => tracing::debug!("no frame available"),
            PipelineError::Detection(e) => tracing::warn!(error = %e, "face detection failed"),
            other => {
                shared.update_diagnostics(|d| d.errors += 1);
                tracing::error!(error = %other, "recognition cycle failed");
            }
        }
        std::thread::sleep(error.backoff(opts));
    }
    tracing::info!("recognition worker exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
