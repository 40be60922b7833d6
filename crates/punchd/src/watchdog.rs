//! Stall detection for the recognition worker.

use crate::config::WatchdogOptions;
use crate::scheduler::Scheduler;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What the watchdog needs to see and poke.
pub trait Supervised: Send + Sync {
    fn source_active(&self) -> bool;
    fn recognition_active(&self) -> bool;
    fn last_heartbeat(&self) -> Instant;
    /// Replace the worker. Must leave the heartbeat at (or after) `now`.
    fn restart(&self, now: Instant) -> bool;
}

impl Supervised for Scheduler {
    fn source_active(&self) -> bool {
        self.shared().source.is_active()
    }

    fn recognition_active(&self) -> bool {
        self.is_active()
    }

    fn last_heartbeat(&self) -> Instant {
        self.shared().heartbeat.last()
    }

    fn restart(&self, now: Instant) -> bool {
        match Scheduler::restart(self) {
            Ok(()) => {
                self.shared().heartbeat.beat(now);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to restart recognition worker");
                false
            }
        }
    }
}

struct Ticker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Watchdog {
    target: Arc<dyn Supervised>,
    options: WatchdogOptions,
    ticker: Mutex<Option<Ticker>>,
}

impl Watchdog {
    pub fn new(target: Arc<dyn Supervised>, options: WatchdogOptions) -> Self {
        Self {
            target,
            options,
            ticker: Mutex::new(None),
        }
    }

    /// One watchdog tick. Returns true if a restart was issued.
    pub fn check(&self, now: Instant) -> bool {
        if !self.target.source_active() || !self.target.recognition_active() {
            return false;
        }
        let age = now.saturating_duration_since(self.target.last_heartbeat());
        if age <= self.options.stall_threshold {
            return false;
        }
        tracing::warn!(
            stalled_ms = age.as_millis() as u64,
            threshold_ms = self.options.stall_threshold.as_millis() as u64,
            "recognition worker stalled, restarting"
        );
        self.target.restart(now)
    }

    /// Spawn the polling thread. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if ticker.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(false);
        }

        let (stop, rx) = mpsc::channel::<()>();
        let this = Arc::clone(self);
        let poll = self.options.poll_interval.max(Duration::from_millis(10));
        let handle = std::thread::Builder::new()
            .name("punch-watchdog".into())
            .spawn(move || {
                tracing::info!(poll_ms = poll.as_millis() as u64, "watchdog started");
                loop {
                    match rx.recv_timeout(poll) {
                        Err(RecvTimeoutError::Timeout) => {
                            this.check(Instant::now());
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("watchdog exiting");
            })?;

        *ticker = Some(Ticker { stop, handle });
        Ok(true)
    }

    pub fn stop(&self) {
        let ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(t) = ticker {
            let _ = t.stop.send(());
            let _ = t.handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }
}
