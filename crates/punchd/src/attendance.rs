//! Duplicate-attendance suppression and the record/notify gate.

use crate::config::AttendanceOptions;
use crate::messages::{AttendanceFields, DuplicatePunch, StreamMessage};
use crate::store::AttendanceStore;
use chrono::{DateTime, Utc};
use punch_core::KeyedThrottle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttendanceDecision {
    /// Write a record; the window for this identity has been armed.
    Record,
    /// Inside the cooldown. `notify` is set at most once per notice interval.
    Duplicate { elapsed: Duration, notify: bool },
    BelowThreshold,
}

/// Per-identity cooldown on accepted attendance records.
pub struct Deduplicator {
    cooldown: Duration,
    min_confidence: f32,
    notice_interval: Duration,
    last_record: Mutex<HashMap<String, Instant>>,
    notices: KeyedThrottle<String>,
}

impl Deduplicator {
    pub fn new(cooldown: Duration, min_confidence: f32, notice_interval: Duration) -> Self {
        Self {
            cooldown,
            min_confidence,
            notice_interval,
            last_record: Mutex::new(HashMap::new()),
            notices: KeyedThrottle::new(),
        }
    }

    pub fn should_record(&self, identity: &str, confidence: f32, now: Instant) -> AttendanceDecision {
        if !(confidence >= self.min_confidence) {
            return AttendanceDecision::BelowThreshold;
        }

        let elapsed = {
            let mut last = self.last_record.lock().unwrap_or_else(|p| p.into_inner());
            match last.get(identity) {
                Some(t) if now.saturating_duration_since(*t) <= self.cooldown => {
                    now.saturating_duration_since(*t)
                }
                _ => {
                    last.insert(identity.to_string(), now);
                    return AttendanceDecision::Record;
                }
            }
        };

        let notify = self
            .notices
            .try_acquire(&identity.to_string(), self.notice_interval, now);
        AttendanceDecision::Duplicate { elapsed, notify }
    }

    pub fn last_recorded(&self, identity: &str) -> Option<Instant> {
        self.last_record
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(identity)
            .copied()
    }

    pub fn reset(&self) {
        self.last_record.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.notices.reset();
    }
}

/// What the gate did with one recognized identity.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// A record was accepted. `log_id` is `None` if the store write failed.
    Recorded(AttendanceFields),
    /// A `duplicate_punch` notice to broadcast.
    Duplicate(StreamMessage),
    Suppressed,
}

/// Deduplicator plus the store it guards.
pub struct AttendanceGate {
    dedup: Deduplicator,
    store: Arc<dyn AttendanceStore>,
    status: String,
    event_type: String,
    last_punch: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AttendanceGate {
    pub fn new(options: &AttendanceOptions, store: Arc<dyn AttendanceStore>) -> Self {
        Self {
            dedup: Deduplicator::new(
                options.cooldown,
                options.min_confidence,
                options.duplicate_notice_interval,
            ),
            store,
            status: options.status.clone(),
            event_type: options.event_type.clone(),
            last_punch: Mutex::new(HashMap::new()),
        }
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn process(
        &self,
        identity: &str,
        display_confidence: f32,
        raw_confidence: Option<f32>,
        now: Instant,
    ) -> GateOutcome {
        match self.dedup.should_record(identity, display_confidence, now) {
            AttendanceDecision::BelowThreshold => GateOutcome::Suppressed,
            AttendanceDecision::Duplicate { notify: false, .. } => GateOutcome::Suppressed,
            AttendanceDecision::Duplicate { elapsed, notify: true } => {
                let last_punch_time = self
                    .last_punch
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(identity)
                    .copied();
                tracing::debug!(identity, elapsed_secs = elapsed.as_secs(), "duplicate punch");
                GateOutcome::Duplicate(StreamMessage::DuplicatePunch {
                    timestamp: Utc::now(),
                    data: DuplicatePunch {
                        employee_id: identity.to_string(),
                        employee_name: identity.to_string(),
                        last_punch_time,
                        elapsed_seconds: elapsed.as_secs(),
                        event_type: self.event_type.clone(),
                    },
                })
            }
            AttendanceDecision::Record => {
                let fields = match self.store.write_attendance(
                    identity,
                    raw_confidence,
                    &self.status,
                    &self.event_type,
                ) {
                    Ok(rec) => {
                        tracing::info!(
                            identity,
                            log_id = %rec.log_id,
                            confidence = display_confidence,
                            "attendance recorded"
                        );
                        AttendanceFields {
                            log_id: Some(rec.log_id),
                            employee_id: rec.employee_id,
                            employee_name: rec.employee_name,
                            timestamp: rec.timestamp,
                            event_type: rec.event_type,
                        }
                    }
                    Err(e) => {
                        tracing::error!(identity, error = %e, "failed to write attendance");
                        AttendanceFields {
                            log_id: None,
                            employee_id: identity.to_string(),
                            employee_name: identity.to_string(),
                            timestamp: Utc::now(),
                            event_type: self.event_type.clone(),
                        }
                    }
                };
                self.last_punch
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(identity.to_string(), fields.timestamp);
                GateOutcome::Recorded(fields)
            }
        }
    }

    pub fn reset(&self) {
        self.dedup.reset();
        self.last_punch.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AttendanceRecord, SqliteStore, StoreError};

    fn dedup() -> Deduplicator {
        Deduplicator::new(Duration::from_secs(30), 0.75, Duration::from_secs(1))
    }

    #[test]
    fn test_first_sighting_records() {
        let d = dedup();
        let t0 = Instant::now();
        assert_eq!(d.should_record("alice", 0.9, t0), AttendanceDecision::Record);
        assert_eq!(d.last_recorded("alice"), Some(t0));
    }

    #[test]
    fn test_below_threshold_is_silent() {
        let d = dedup();
        let t0 = Instant::now();
        assert_eq!(d.should_record("alice", 0.5, t0), AttendanceDecision::BelowThreshold);
        assert_eq!(d.should_record("alice", f32::NAN, t0), AttendanceDecision::BelowThreshold);
        assert!(d.last_recorded("alice").is_none());
    }

    #[test]
    fn test_second_accept_within_cooldown_is_duplicate() {
        let d = dedup();
        let t0 = Instant::now();
        assert_eq!(d.should_record("alice", 0.9, t0), AttendanceDecision::Record);
        let decision = d.should_record("alice", 0.9, t0 + Duration::from_secs(10));
        assert_eq!(
            decision,
            AttendanceDecision::Duplicate { elapsed: Duration::from_secs(10), notify: true }
        );
        assert_eq!(d.last_recorded("alice"), Some(t0));
    }

    #[test]
    fn test_duplicate_notice_is_throttled() {
        let d = dedup();
        let t0 = Instant::now();
        d.should_record("alice", 0.9, t0);
        let notified: Vec<bool> = (1..=20)
            .map(|i| d.should_record("alice", 0.9, t0 + Duration::from_millis(5000 + i * 10)))
            .map(|dec| matches!(dec, AttendanceDecision::Duplicate { notify: true, .. }))
            .collect();
        assert_eq!(notified.iter().filter(|n| **n).count(), 1);
    }

    #[test]
    fn test_cooldown_boundary_is_exclusive() {
        let d = dedup();
        let t0 = Instant::now();
        d.should_record("alice", 0.9, t0);
        assert!(matches!(
            d.should_record("alice", 0.9, t0 + Duration::from_secs(30)),
            AttendanceDecision::Duplicate { .. }
        ));
        assert_eq!(
            d.should_record("alice", 0.9, t0 + Duration::from_millis(30_001)),
            AttendanceDecision::Record
        );
    }

    #[test]
    fn test_concurrent_sightings_record_once() {
        let d = dedup();
        let t0 = Instant::now();
        let start = std::sync::Barrier::new(16);
        let decisions: Vec<AttendanceDecision> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        start.wait();
                        d.should_record("alice", 0.9, t0)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        let records = decisions
            .iter()
            .filter(|dec| **dec == AttendanceDecision::Record)
            .count();
        assert_eq!(records, 1);
        assert!(decisions
            .iter()
            .all(|dec| matches!(dec, AttendanceDecision::Record | AttendanceDecision::Duplicate { .. })));
        assert_eq!(d.last_recorded("alice"), Some(t0));
    }

    #[test]
    fn test_identities_are_independent() {
        let d = dedup();
        let t0 = Instant::now();
        assert_eq!(d.should_record("alice", 0.9, t0), AttendanceDecision::Record);
        assert_eq!(d.should_record("bob", 0.9, t0), AttendanceDecision::Record);
        d.reset();
        assert_eq!(d.should_record("alice", 0.9, t0), AttendanceDecision::Record);
    }

    #[test]
    fn test_gate_records_once_and_notifies_duplicate() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gate = AttendanceGate::new(&AttendanceOptions::default(), store.clone());
        let t0 = Instant::now();

        let fields = match gate.process("alice", 1.0, Some(0.8), t0) {
            GateOutcome::Recorded(fields) => fields,
            other => panic!("expected a record, got {other:?}"),
        };
        assert!(fields.log_id.is_some());
        assert_eq!(fields.event_type, "check-in");

        let data = match gate.process("alice", 1.0, Some(0.8), t0 + Duration::from_secs(10)) {
            GateOutcome::Duplicate(StreamMessage::DuplicatePunch { data, .. }) => data,
            other => panic!("expected a duplicate notice, got {other:?}"),
        };
        assert_eq!(data.elapsed_seconds, 10);
        assert_eq!(data.last_punch_time, Some(fields.timestamp));
        assert_eq!(store.attendance_count("alice").unwrap(), 1);
    }

    struct FailingStore;

    impl AttendanceStore for FailingStore {
        fn write_attendance(
            &self,
            _identity: &str,
            _confidence: Option<f32>,
            _status: &str,
            _event_type: &str,
        ) -> Result<AttendanceRecord, StoreError> {
            Err(StoreError::Database(rusqlite::Error::InvalidQuery))
        }
    }

    #[test]
    fn test_store_failure_still_arms_window() {
        let gate = AttendanceGate::new(&AttendanceOptions::default(), Arc::new(FailingStore));
        let t0 = Instant::now();
        let GateOutcome::Recorded(fields) = gate.process("alice", 0.9, Some(0.7), t0) else {
            panic!("expected a record");
        };
        assert!(fields.log_id.is_none());
        assert_eq!(gate.deduplicator().last_recorded("alice"), Some(t0));
        assert!(matches!(
            gate.process("alice", 0.9, Some(0.7), t0 + Duration::from_secs(1)),
            GateOutcome::Duplicate(_)
        ));
    }
}
