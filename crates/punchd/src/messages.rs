//! Messages fanned out to stream subscribers.
//!
//! Serialized with a `"type"` tag so viewers can dispatch on the kind.

use chrono::{DateTime, Utc};
use punch_core::BoundingBox;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Per-cycle face overlay, in stream coordinates.
    FaceDetected {
        timestamp: DateTime<Utc>,
        faces: Vec<FacePayload>,
        #[serde(rename = "streamWidth")]
        stream_width: u32,
        #[serde(rename = "streamHeight")]
        stream_height: u32,
        data: FaceCount,
    },
    /// First recognized identity of a cycle.
    PersonRecognized {
        timestamp: DateTime<Utc>,
        data: RecognizedPerson,
    },
    /// A recognized identity inside its attendance cooldown.
    DuplicatePunch {
        timestamp: DateTime<Utc>,
        data: DuplicatePunch,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    /// Snapshot sent once right after subscribing.
    Status(StatusSnapshot),
    Connection {
        message: String,
    },
}

impl StreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::FaceDetected { .. } => "face_detected",
            StreamMessage::PersonRecognized { .. } => "person_recognized",
            StreamMessage::DuplicatePunch { .. } => "duplicate_punch",
            StreamMessage::Heartbeat { .. } => "heartbeat",
            StreamMessage::Status(_) => "status",
            StreamMessage::Connection { .. } => "connection",
        }
    }

    pub fn heartbeat() -> Self {
        StreamMessage::Heartbeat { timestamp: Utc::now() }
    }

    pub fn connection() -> Self {
        StreamMessage::Connection {
            message: "Connected to recognition stream".to_string(),
        }
    }

    pub fn face_detected(faces: Vec<FacePayload>, stream_width: u32, stream_height: u32) -> Self {
        let faces_detected = faces.len();
        StreamMessage::FaceDetected {
            timestamp: Utc::now(),
            faces,
            stream_width,
            stream_height,
            data: FaceCount { faces_detected },
        }
    }

    pub fn to_json(&self) -> String {
        // Every field is a plain value; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceCount {
    pub faces_detected: usize,
}

/// One face of the overlay, box already scaled to the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacePayload {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    /// Display confidence in [0, 1].
    pub confidence: f32,
    pub recognized: bool,
    pub name: String,
    pub age: Option<u32>,
    pub emotion: Option<String>,
    pub spoof: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedPerson {
    pub name: String,
    pub confidence: f32,
    /// Present once the attendance record for this cycle has been written.
    #[serde(flatten)]
    pub attendance: Option<AttendanceFields>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceFields {
    pub log_id: Option<String>,
    pub employee_id: String,
    pub employee_name: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePunch {
    pub employee_id: String,
    pub employee_name: String,
    pub last_punch_time: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub faces_detected: usize,
    pub recognitions: Vec<FaceReport>,
    pub camera_active: bool,
    pub statistics: StreamStatistics,
}

impl StatusSnapshot {
    pub fn new(recognitions: Vec<FaceReport>, camera_active: bool, uptime_secs: u64) -> Self {
        let recognized = recognitions.iter().filter(|r| r.recognized).count();
        Self {
            timestamp: Utc::now(),
            faces_detected: recognitions.len(),
            statistics: StreamStatistics {
                total_faces: recognitions.len(),
                recognized_faces: recognized,
                events_received: 0,
                uptime: uptime_secs,
            },
            recognitions,
            camera_active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatistics {
    pub total_faces: usize,
    pub recognized_faces: usize,
    pub events_received: u64,
    pub uptime: u64,
}

/// Result for one face of the most recent cycle, in frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceReport {
    pub face_id: usize,
    pub name: String,
    pub recognized: bool,
    pub distance: Option<f32>,
    pub confidence_raw: Option<f32>,
    pub confidence: f32,
    pub location: BoundingBox,
    pub spoof: Option<bool>,
    pub spoof_score: Option<f32>,
    pub age: Option<u32>,
    pub emotion: Option<String>,
    pub timestamp: DateTime<Utc>,
}
