use anyhow::{Context, Result};
use punch_core::{AttributeAnalyzer, MarginMatcher, Roster, RosterHandle, SharpnessSpoofCheck, SpoofCheck};
use punch_hw::{Camera, CapturePump, FrameBuffer, FrameSource};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod events;
mod hub;
mod load;
mod messages;
mod pipeline;
mod scheduler;
mod sidecar;
mod store;
mod watchdog;

use attendance::AttendanceGate;
use config::Config;
use dbus_interface::{RecognitionService, BUS_NAME, OBJECT_PATH};
use events::EventClassifier;
use hub::BroadcastHub;
use load::LoadAverage;
use pipeline::RecognitionPipeline;
use scheduler::Shared;
use sidecar::SidecarEmbedder;
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("punchd starting");

    let config = Config::from_env().context("invalid configuration")?;
    let options = config.options.clone();

    let camera = match Camera::open(&config.camera_device, config.camera_width, config.camera_height) {
        Ok(camera) => camera,
        Err(e) => {
            tracing::warn!(device = %config.camera_device, error = %e, "camera unavailable, will retry");
            Camera::detached(&config.camera_device, config.camera_width, config.camera_height)
        }
    };
    let source: Arc<dyn FrameSource> = Arc::new(camera);
    let buffer = Arc::new(FrameBuffer::default());
    let mut pump = CapturePump::spawn(
        Arc::clone(&source),
        Arc::clone(&buffer),
        config.capture_interval(),
        options.scheduler.capture_retry,
    )
    .context("failed to start capture pump")?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );
    tracing::info!(path = %config.db_path.display(), "database opened");

    let roster = match pipeline::load_roster(&config.roster_path) {
        Ok(roster) => roster,
        Err(e) => {
            tracing::warn!(error = %e, "starting with an empty roster");
            Roster::default()
        }
    };
    tracing::info!(entries = roster.len(), identities = roster.identity_count(), "roster loaded");

    let analyzers = &options.analyzers;
    let embedder = Arc::new(
        SidecarEmbedder::new(config.sidecar_command.clone(), config.sidecar_timeout)
            .with_attributes(analyzers.age, analyzers.emotion),
    );
    let attributes = (analyzers.age || analyzers.emotion)
        .then(|| Arc::clone(&embedder) as Arc<dyn AttributeAnalyzer>);
    let spoof = analyzers.spoof.then(|| {
        Arc::new(SharpnessSpoofCheck {
            threshold: analyzers.sharpness_threshold,
        }) as Arc<dyn SpoofCheck>
    });

    let shared = Arc::new(Shared::new(
        source,
        buffer,
        embedder.clone(),
        attributes,
        spoof,
        Arc::new(LoadAverage::new(options.scheduler.load_threshold)),
        Box::new(MarginMatcher::new(options.matching)),
        Arc::new(RosterHandle::new(roster)),
        AttendanceGate::new(&options.attendance, store.clone()),
        EventClassifier::new(options.events.clone(), store, config.snapshot_dir.clone()),
        Arc::new(BroadcastHub::new(options.hub.clone())),
        options,
    ));
    let pipeline = Arc::new(RecognitionPipeline::new(shared, Some(config.roster_path.clone())));

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RecognitionService::new(Arc::clone(&pipeline)))?
        .build()
        .await
        .context("failed to register on the session bus")?;
    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let bridge = tokio::spawn(forward_stream(conn.clone(), Arc::clone(&pipeline)));

    if config.autostart {
        let p = Arc::clone(&pipeline);
        tokio::task::spawn_blocking(move || p.start())
            .await?
            .context("failed to start recognition")?;
    }

    tracing::info!("punchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("punchd shutting down");

    bridge.abort();
    tokio::task::spawn_blocking(move || {
        pipeline.stop();
        pump.stop();
        embedder.shutdown();
    })
    .await?;

    Ok(())
}

/// Re-emit every hub message as a D-Bus signal. Resubscribes if the hub
/// drops the bridge for falling behind.
async fn forward_stream(conn: zbus::Connection, pipeline: Arc<RecognitionPipeline>) {
    let emitter = match zbus::object_server::SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot emit stream signals");
            return;
        }
    };

    loop {
        let mut subscriber = pipeline.subscribe();
        tracing::debug!(subscriber = subscriber.id(), "stream bridge subscribed");
        while let Some(msg) = subscriber.recv().await {
            if let Err(e) = RecognitionService::stream_message(&emitter, &msg.to_json()).await {
                tracing::warn!(kind = msg.kind(), error = %e, "failed to emit stream message");
            }
        }
        tracing::warn!("stream bridge dropped by hub, resubscribing");
    }
}
