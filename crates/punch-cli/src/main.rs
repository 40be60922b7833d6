use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use punch_hw::{Camera, FrameSource};
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "io.punchclock.Recognition1",
    default_service = "io.punchclock.Recognition1",
    default_path = "/io/punchclock/Recognition1"
)]
trait Recognition {
    fn start(&self) -> zbus::Result<bool>;
    fn stop(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn latest_results(&self) -> zbus::Result<String>;
    fn reload_roster(&self) -> zbus::Result<u32>;

    #[zbus(signal)]
    fn stream_message(&self, message: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "punch", about = "punchclock recognition daemon CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Start live recognition
    Start,
    /// Stop live recognition
    Stop,
    /// Print the faces from the latest recognition pass
    Results,
    /// Re-read the roster file
    Reload,
    /// Follow the detection stream until interrupted
    Watch {
        /// Only show messages of this type (e.g. "face_detected")
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// Run camera diagnostics without the daemon
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 960)]
        width: u32,
        #[arg(long, default_value_t = 540)]
        height: u32,
        /// Number of frames to grab
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
        /// Save the last frame as PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let status = connect().await?.status().await.context("punchd: not reachable")?;
            print_json(&status)?;
        }
        Commands::Start => {
            if connect().await?.start().await? {
                println!("recognition started");
            } else {
                println!("recognition already running");
            }
        }
        Commands::Stop => {
            if connect().await?.stop().await? {
                println!("recognition stopped");
            } else {
                println!("recognition was not running");
            }
        }
        Commands::Results => print_json(&connect().await?.latest_results().await?)?,
        Commands::Reload => {
            let entries = connect().await?.reload_roster().await?;
            println!("roster reloaded: {entries} entries");
        }
        Commands::Watch { kind } => watch(&connect().await?, kind.as_deref()).await?,
        Commands::Test {
            device,
            width,
            height,
            frames,
            output,
        } => {
            tokio::task::spawn_blocking(move || camera_test(&device, width, height, frames, output))
                .await??;
        }
    }

    Ok(())
}

async fn connect() -> Result<RecognitionProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    Ok(RecognitionProxy::new(&conn).await?)
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn watch(proxy: &RecognitionProxy<'_>, kind: Option<&str>) -> Result<()> {
    let mut stream = proxy.receive_stream_message().await?;
    println!("watching detection stream, Ctrl-C to stop");
    loop {
        tokio::select! {
            signal = stream.next() => {
                let Some(signal) = signal else { bail!("stream closed by daemon") };
                let args = signal.args()?;
                let message = args.message();
                if let Some(kind) = kind {
                    let value: serde_json::Value = serde_json::from_str(message)?;
                    if value.get("type").and_then(|t| t.as_str()) != Some(kind) {
                        continue;
                    }
                }
                println!("{message}");
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn camera_test(device: &str, width: u32, height: u32, frames: u32, output: Option<PathBuf>) -> Result<()> {
    println!("opening {device} at {width}x{height}");
    let camera = Camera::open(device, width, height)?;
    if let Some((w, h)) = camera.resolution() {
        println!("negotiated {w}x{h}");
    }

    let mut last = None;
    let mut misses = 0u32;
    for _ in 0..frames {
        match camera.read_frame() {
            Some(frame) => {
                println!("frame {:>4}: brightness {:.1}", frame.sequence, frame.avg_brightness());
                last = Some(frame);
            }
            None => {
                misses += 1;
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    println!("{} frames, {misses} misses", frames - misses);

    if let Some(path) = output {
        let Some(frame) = last else { bail!("no frame captured") };
        let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame does not match its dimensions")?;
        img.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("saved {}", path.display());
    }
    Ok(())
}
