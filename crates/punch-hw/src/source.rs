//! Frame source contract and the capture pump that feeds the buffer.

use crate::buffer::FrameBuffer;
use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Anything that can hand out frames: a camera, a file, a test fixture.
pub trait FrameSource: Send + Sync {
    /// Grab one frame. `None` is a transient miss.
    fn read_frame(&self) -> Option<Frame>;

    /// Tear down and reopen the underlying device. Returns true on success.
    fn reinitialize(&self) -> bool;

    /// Whether the source is currently delivering frames.
    fn is_active(&self) -> bool;
}

/// Background thread pulling frames from a source into a [`FrameBuffer`].
pub struct CapturePump {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CapturePump {
    /// Spawn the pump. `interval` paces successful reads; misses back off
    /// for `miss_backoff` before retrying.
    pub fn spawn(
        source: Arc<dyn FrameSource>,
        buffer: Arc<FrameBuffer>,
        interval: Duration,
        miss_backoff: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("punch-capture".into())
            .spawn(move || {
                tracing::info!("capture pump started");
                let mut misses = 0u64;
                while flag.load(Ordering::Acquire) {
                    match source.read_frame() {
                        Some(frame) => {
                            if misses > 0 {
                                tracing::debug!(misses, "capture recovered");
                                misses = 0;
                            }
                            buffer.push(frame);
                            std::thread::sleep(interval);
                        }
                        None => {
                            misses += 1;
                            std::thread::sleep(miss_backoff);
                        }
                    }
                }
                tracing::info!("capture pump exiting");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the pump to stop and wait for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CapturePump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingSource {
        next: AtomicU32,
    }

    impl FrameSource for CountingSource {
        fn read_frame(&self) -> Option<Frame> {
            let seq = self.next.fetch_add(1, Ordering::SeqCst);
            // Every third read misses.
            if seq % 3 == 2 {
                return None;
            }
            Frame::new(vec![0; 4], 2, 2, seq).ok()
        }

        fn reinitialize(&self) -> bool {
            true
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_pump_fills_buffer_and_stops() {
        let source = Arc::new(CountingSource { next: AtomicU32::new(0) });
        let buffer = Arc::new(FrameBuffer::new(4));
        let mut pump = CapturePump::spawn(
            source,
            Arc::clone(&buffer),
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while buffer.len() < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pump.stop();
        assert!(!pump.is_running());
        assert_eq!(buffer.len(), 4);
        assert!(buffer.snapshot().iter().all(|f| f.sequence % 3 != 2));
    }
}
