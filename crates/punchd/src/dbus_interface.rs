use crate::pipeline::RecognitionPipeline;
use std::sync::Arc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "io.punchclock.Recognition1";
pub const OBJECT_PATH: &str = "/io/punchclock/Recognition1";

/// D-Bus interface for the punchclock recognition daemon.
///
/// Bus name: io.punchclock.Recognition1
/// Object path: /io/punchclock/Recognition1
pub struct RecognitionService {
    pipeline: Arc<RecognitionPipeline>,
}

impl RecognitionService {
    pub fn new(pipeline: Arc<RecognitionPipeline>) -> Self {
        Self { pipeline }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[interface(name = "io.punchclock.Recognition1")]
impl RecognitionService {
    /// Start recognition. Returns false if it was already running.
    async fn start(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("start requested");
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.start())
            .await
            .map_err(failed)?
            .map_err(failed)
    }

    /// Stop recognition. Returns false if it was not running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.stop())
            .await
            .map_err(failed)
    }

    /// Return daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.pipeline.status())
    }

    /// Faces from the most recent recognition pass, as JSON.
    async fn latest_results(&self) -> zbus::fdo::Result<String> {
        to_json(&self.pipeline.latest_results())
    }

    /// Re-read the roster file. Returns the number of entries loaded.
    async fn reload_roster(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("roster reload requested");
        let pipeline = Arc::clone(&self.pipeline);
        let entries = tokio::task::spawn_blocking(move || pipeline.reload_roster_from_file())
            .await
            .map_err(failed)?
            .map_err(|e| {
                tracing::warn!(error = %e, "roster reload failed");
                failed(e)
            })?;
        Ok(u32::try_from(entries).unwrap_or(u32::MAX))
    }

    /// Report eyewear seen by an external detector. A non-finite `angle`
    /// means no angle is known. Returns true if an event was logged.
    async fn report_glasses_detected(&self, angle: f64) -> bool {
        let angle = angle.is_finite().then_some(angle as f32);
        self.pipeline.report_glasses_detected(angle)
    }

    /// One JSON-encoded stream message per emission.
    #[zbus(signal)]
    pub async fn stream_message(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;
}
