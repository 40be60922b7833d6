//! Bounded latest-frame buffer between the capture pump and the recognizer.

use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const DEFAULT_CAPACITY: usize = 24;

/// Holds at most `capacity` frames, evicting the oldest on overflow.
///
/// The consumer only ever reads the tail, so a slow recognizer sees the
/// freshest frame instead of draining a backlog.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Arc<Frame>>>,
    capacity: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FrameBuffer {
    /// Create a buffer holding up to `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, frame: impl Into<Arc<Frame>>) {
        let frame = frame.into();
        let mut frames = self.frames.lock().unwrap_or_else(|p| p.into_inner());
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Most recently pushed frame, left in place.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.frames
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .back()
            .cloned()
    }

    /// All buffered frames, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Frame>> {
        self.frames
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u32) -> Frame {
        Frame::new(vec![0; 4], 2, 2, seq).unwrap()
    }

    #[test]
    fn test_empty_buffer_has_no_latest() {
        let buf = FrameBuffer::new(4);
        assert!(buf.latest().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_overflow_keeps_last_n_in_order() {
        let n = 24;
        let buf = FrameBuffer::new(n);
        for seq in 0..=n as u32 {
            buf.push(frame(seq));
        }
        let seqs: Vec<u32> = buf.snapshot().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, (1..=n as u32).collect::<Vec<_>>());
        assert_eq!(buf.latest().unwrap().sequence, n as u32);
        assert_eq!(buf.len(), n);
    }

    #[test]
    fn test_latest_does_not_remove() {
        let buf = FrameBuffer::new(2);
        buf.push(frame(7));
        assert_eq!(buf.latest().unwrap().sequence, 7);
        assert_eq!(buf.latest().unwrap().sequence, 7);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buf = FrameBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(frame(1));
        buf.push(frame(2));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.latest().unwrap().sequence, 2);
    }

    #[test]
    fn test_concurrent_readers_see_valid_frames() {
        let buf = Arc::new(FrameBuffer::new(8));
        let writer = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                for seq in 0..1000 {
                    buf.push(frame(seq));
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(buf.len() <= 8);
                        let _ = buf.latest();
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(buf.latest().unwrap().sequence, 999);
    }
}
