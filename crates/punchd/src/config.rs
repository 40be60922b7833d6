use punch_core::MatchPolicy;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid options file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid option {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Target capture rate of the pump feeding the frame buffer.
    pub capture_fps: u32,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// JSON roster file, re-read on every reload.
    pub roster_path: PathBuf,
    /// Where `anti_spoof` event snapshots are written; `None` disables them.
    pub snapshot_dir: Option<PathBuf>,
    /// argv of the detector/embedder sidecar process.
    pub sidecar_command: Vec<String>,
    /// Per-call timeout for the sidecar.
    pub sidecar_timeout: Duration,
    /// Start recognition as soon as the camera is up.
    pub autostart: bool,
    pub options: RecognitionOptions,
}

impl Config {
    /// Load configuration from `PUNCH_*` environment variables with defaults.
    ///
    /// Tunables come from the TOML file named by `PUNCH_CONFIG` (if any),
    /// then individual env overrides, then validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("punchclock");

        let mut options = match std::env::var("PUNCH_CONFIG") {
            Ok(path) => RecognitionOptions::from_file(PathBuf::from(path))?,
            Err(_) => RecognitionOptions::default(),
        };
        options.apply_overrides(|key| std::env::var(key).ok());
        options.validate()?;

        let sidecar_timeout = Duration::from_millis(env_parse("PUNCH_SIDECAR_TIMEOUT_MS", 3000));
        options.check_call_timeout(sidecar_timeout)?;

        let sidecar_command = std::env::var("PUNCH_SIDECAR")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|_| vec!["punch-embedder".to_string()]);

        Ok(Self {
            camera_device: std::env::var("PUNCH_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_parse("PUNCH_CAMERA_WIDTH", 960),
            camera_height: env_parse("PUNCH_CAMERA_HEIGHT", 540),
            capture_fps: env_parse("PUNCH_CAPTURE_FPS", 15u32).max(1),
            db_path: std::env::var("PUNCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("punchclock.db")),
            roster_path: std::env::var("PUNCH_ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("roster.json")),
            snapshot_dir: match std::env::var("PUNCH_SNAPSHOT_DIR") {
                Ok(v) if v.is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => Some(data_dir.join("event_images")),
            },
            sidecar_command,
            sidecar_timeout,
            autostart: std::env::var("PUNCH_AUTOSTART")
                .map(|v| v != "0")
                .unwrap_or(true),
            options,
        })
    }

    /// Interval between capture pump reads.
    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs(1) / self.capture_fps
    }
}

/// Every tunable of the recognition pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecognitionOptions {
    pub matching: MatchPolicy,
    pub scheduler: SchedulerOptions,
    pub attendance: AttendanceOptions,
    pub events: EventCooldowns,
    pub watchdog: WatchdogOptions,
    pub hub: HubOptions,
    pub analyzers: AnalyzerOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Minimum time between full recognition passes.
    #[serde(deserialize_with = "secs")]
    pub cycle_interval: Duration,
    #[serde(deserialize_with = "secs")]
    pub load_poll_interval: Duration,
    /// Under high load, passes are at least this far apart.
    #[serde(deserialize_with = "secs")]
    pub load_min_interval: Duration,
    #[serde(deserialize_with = "secs")]
    pub load_backoff: Duration,
    /// 1-minute load average per CPU at which the host counts as busy.
    pub load_threshold: f32,
    #[serde(deserialize_with = "secs")]
    pub retry_sleep: Duration,
    #[serde(deserialize_with = "secs")]
    pub capture_retry: Duration,
    /// Consecutive frame misses before the source is reinitialized.
    pub reinit_after_misses: u32,
    #[serde(deserialize_with = "secs")]
    pub detect_backoff: Duration,
    #[serde(deserialize_with = "secs")]
    pub error_backoff: Duration,
    #[serde(deserialize_with = "secs")]
    pub empty_broadcast_interval: Duration,
    /// Sleep after a pass with no faces.
    #[serde(deserialize_with = "secs")]
    pub idle_sleep: Duration,
    /// Sleep after a pass with faces.
    #[serde(deserialize_with = "secs")]
    pub active_sleep: Duration,
    #[serde(deserialize_with = "secs")]
    pub join_timeout: Duration,
    #[serde(deserialize_with = "secs")]
    pub debug_log_interval: Duration,
    /// Process every detected face, or only the first.
    pub multi_face: bool,
    pub stream_width: u32,
    pub stream_height: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_millis(450),
            load_poll_interval: Duration::from_secs(2),
            load_min_interval: Duration::from_secs(1),
            load_backoff: Duration::from_millis(200),
            load_threshold: 0.85,
            retry_sleep: Duration::from_millis(60),
            capture_retry: Duration::from_millis(100),
            reinit_after_misses: 5,
            detect_backoff: Duration::from_millis(120),
            error_backoff: Duration::from_secs(1),
            empty_broadcast_interval: Duration::from_millis(500),
            idle_sleep: Duration::from_millis(150),
            active_sleep: Duration::from_millis(60),
            join_timeout: Duration::from_secs(2),
            debug_log_interval: Duration::from_secs(5),
            multi_face: true,
            stream_width: 640,
            stream_height: 360,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttendanceOptions {
    /// Minimum time between two accepted records of one identity.
    #[serde(deserialize_with = "secs")]
    pub cooldown: Duration,
    /// Minimum display confidence for a record.
    pub min_confidence: f32,
    #[serde(deserialize_with = "secs")]
    pub duplicate_notice_interval: Duration,
    pub status: String,
    pub event_type: String,
}

impl Default for AttendanceOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            min_confidence: 0.75,
            duplicate_notice_interval: Duration::from_secs(1),
            status: "Present".to_string(),
            event_type: "check-in".to_string(),
        }
    }
}

/// Per-kind cooldowns of the event log.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventCooldowns {
    #[serde(deserialize_with = "secs")]
    pub event: Duration,
    #[serde(deserialize_with = "secs")]
    pub detected: Duration,
    #[serde(deserialize_with = "secs")]
    pub recognized: Duration,
    #[serde(deserialize_with = "secs")]
    pub multi_face: Duration,
    #[serde(deserialize_with = "secs")]
    pub anti_spoof: Duration,
    #[serde(deserialize_with = "secs")]
    pub glasses_detected: Duration,
    /// `camera_start` / `camera_stop`.
    #[serde(deserialize_with = "secs")]
    pub lifecycle: Duration,
}

impl Default for EventCooldowns {
    fn default() -> Self {
        Self {
            event: Duration::from_secs(5),
            detected: Duration::from_secs(5),
            recognized: Duration::from_secs(5),
            multi_face: Duration::from_secs(10),
            anti_spoof: Duration::from_secs(30),
            glasses_detected: Duration::from_secs(10),
            lifecycle: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogOptions {
    #[serde(deserialize_with = "secs")]
    pub poll_interval: Duration,
    /// Heartbeat age beyond which the scheduler is considered wedged.
    #[serde(deserialize_with = "secs")]
    pub stall_threshold: Duration,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            stall_threshold: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubOptions {
    /// Per-subscriber queue depth; a full queue drops the subscriber.
    pub queue_capacity: usize,
    /// Idle time after which a subscriber receives a heartbeat.
    #[serde(deserialize_with = "secs")]
    pub idle_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerOptions {
    pub age: bool,
    pub emotion: bool,
    pub spoof: bool,
    #[serde(deserialize_with = "secs")]
    pub attribute_interval: Duration,
    #[serde(deserialize_with = "secs")]
    pub spoof_interval: Duration,
    pub sharpness_threshold: f32,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            age: false,
            emotion: false,
            spoof: true,
            attribute_interval: Duration::from_millis(1500),
            spoof_interval: Duration::from_millis(500),
            sharpness_threshold: punch_core::spoof::DEFAULT_SHARPNESS_THRESHOLD,
        }
    }
}

impl RecognitionOptions {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(src)?)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    /// Apply `PUNCH_*` overrides looked up through `get`. Unparseable values
    /// are ignored with a warning.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| -> Option<f64> {
            let raw = get(key)?;
            match raw.trim().parse::<f64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable override");
                    None
                }
            }
        };

        if let Some(v) = lookup("PUNCH_TOLERANCE") {
            self.matching.tolerance = v as f32;
        }
        if let Some(v) = lookup("PUNCH_MARGIN") {
            self.matching.margin = v as f32;
        }
        if let Some(v) = lookup("PUNCH_CONFIDENCE_SCALE") {
            self.matching.confidence_scale = v as f32;
        }
        if let Some(v) = lookup("PUNCH_ATTENDANCE_MIN_CONFIDENCE") {
            self.attendance.min_confidence = v as f32;
        }
        if let Some(d) = lookup("PUNCH_ATTENDANCE_COOLDOWN_SECS").and_then(|v| Duration::try_from_secs_f64(v).ok()) {
            self.attendance.cooldown = d;
        }
        if let Some(d) = lookup("PUNCH_CYCLE_INTERVAL_MS").and_then(|v| Duration::try_from_secs_f64(v / 1000.0).ok()) {
            self.scheduler.cycle_interval = d;
        }
        if let Some(v) = get("PUNCH_MULTI_FACE") {
            self.scheduler.multi_face = v != "0";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.matching;
        if !(m.tolerance > 0.0) {
            return Err(invalid("matching.tolerance", "must be positive"));
        }
        if !(m.margin >= 0.0) {
            return Err(invalid("matching.margin", "must not be negative"));
        }
        if !(m.confidence_scale > 0.0) {
            return Err(invalid("matching.confidence_scale", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.attendance.min_confidence) {
            return Err(invalid("attendance.min_confidence", "must be within [0, 1]"));
        }
        if !(self.scheduler.load_threshold > 0.0 && self.scheduler.load_threshold.is_finite()) {
            return Err(invalid("scheduler.load_threshold", "must be a positive number"));
        }
        if self.scheduler.cycle_interval.is_zero() {
            return Err(invalid("scheduler.cycle_interval", "must be positive"));
        }
        if self.watchdog.stall_threshold <= self.scheduler.cycle_interval {
            return Err(invalid(
                "watchdog.stall_threshold",
                "must exceed scheduler.cycle_interval",
            ));
        }
        if self.hub.queue_capacity < 2 {
            return Err(invalid(
                "hub.queue_capacity",
                "must hold at least the connection and status messages",
            ));
        }
        Ok(())
    }

    /// A single collaborator call runs with no heartbeat, so its timeout
    /// must leave the watchdog room.
    pub fn check_call_timeout(&self, timeout: Duration) -> Result<(), ConfigError> {
        if timeout.is_zero() {
            return Err(invalid("PUNCH_SIDECAR_TIMEOUT_MS", "must be positive"));
        }
        if timeout >= self.watchdog.stall_threshold {
            return Err(invalid(
                "PUNCH_SIDECAR_TIMEOUT_MS",
                "must be below watchdog.stall_threshold",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// Deserialize a duration given as (fractional) seconds.
fn secs<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let v = f64::deserialize(d)?;
    Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let opts = RecognitionOptions::default();
        opts.validate().unwrap();
        assert_eq!(opts.scheduler.cycle_interval, Duration::from_millis(450));
        assert_eq!(opts.attendance.cooldown, Duration::from_secs(30));
        assert_eq!(opts.matching.margin, 0.06);
        assert_eq!(opts.attendance.min_confidence, 0.75);
    }

    #[test]
    fn test_toml_partial_override() {
        let opts = RecognitionOptions::from_toml_str(
            r#"
            [matching]
            tolerance = 0.5

            [scheduler]
            cycle_interval = 0.25
            multi_face = false

            [events]
            anti_spoof = 60
            "#,
        )
        .unwrap();
        assert_eq!(opts.matching.tolerance, 0.5);
        assert_eq!(opts.matching.margin, 0.06);
        assert_eq!(opts.scheduler.cycle_interval, Duration::from_millis(250));
        assert!(!opts.scheduler.multi_face);
        assert_eq!(opts.events.anti_spoof, Duration::from_secs(60));
        assert_eq!(opts.events.multi_face, Duration::from_secs(10));
    }

    #[test]
    fn test_toml_rejects_negative_duration() {
        let err = RecognitionOptions::from_toml_str("[watchdog]\nstall_threshold = -1.0\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PUNCH_TOLERANCE", "0.55"),
            ("PUNCH_ATTENDANCE_COOLDOWN_SECS", "90"),
            ("PUNCH_CYCLE_INTERVAL_MS", "250"),
            ("PUNCH_MULTI_FACE", "0"),
            ("PUNCH_MARGIN", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut opts = RecognitionOptions::default();
        opts.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(opts.matching.tolerance, 0.55);
        assert_eq!(opts.matching.margin, 0.06);
        assert_eq!(opts.attendance.cooldown, Duration::from_secs(90));
        assert_eq!(opts.scheduler.cycle_interval, Duration::from_millis(250));
        assert!(!opts.scheduler.multi_face);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut opts = RecognitionOptions::default();
        opts.attendance.min_confidence = 1.5;
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::Invalid { key: "attendance.min_confidence", .. })
        ));

        let mut opts = RecognitionOptions::default();
        opts.watchdog.stall_threshold = Duration::from_millis(100);
        assert!(opts.validate().is_err());

        let mut opts = RecognitionOptions::default();
        opts.hub.queue_capacity = 1;
        assert!(opts.validate().is_err());

        let mut opts = RecognitionOptions::default();
        opts.scheduler.load_threshold = f32::NAN;
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::Invalid { key: "scheduler.load_threshold", .. })
        ));
    }

    #[test]
    fn test_load_threshold_from_toml() {
        let opts = RecognitionOptions::from_toml_str("[scheduler]\nload_threshold = 1.5\n").unwrap();
        assert_eq!(opts.scheduler.load_threshold, 1.5);
        assert_eq!(RecognitionOptions::default().scheduler.load_threshold, 0.85);
    }

    #[test]
    fn test_call_timeout_must_fit_stall_threshold() {
        let opts = RecognitionOptions::default();
        opts.check_call_timeout(Duration::from_secs(3)).unwrap();
        assert!(opts.check_call_timeout(Duration::from_secs(4)).is_err());
        assert!(opts.check_call_timeout(Duration::from_secs(10)).is_err());
        assert!(opts.check_call_timeout(Duration::ZERO).is_err());

        let mut relaxed = RecognitionOptions::default();
        relaxed.watchdog.stall_threshold = Duration::from_secs(12);
        relaxed.check_call_timeout(Duration::from_secs(10)).unwrap();
    }
}
