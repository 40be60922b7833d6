//! Cooldown gates keyed by time of last acceptance.
//!
//! Callers pass `now` explicitly so the gates are deterministic under test.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single cooldown gate: at most one acquisition per `interval`.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Returns true and arms the gate if the interval has elapsed since the
    /// previous acquisition (or there was none).
    pub fn try_acquire(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let ready = last.map_or(true, |t| now.saturating_duration_since(t) >= self.interval);
        if ready {
            *last = Some(now);
        }
        ready
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Independent cooldown gates per key, checked and armed under one lock.
#[derive(Debug)]
pub struct KeyedThrottle<K> {
    last: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedThrottle<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedThrottle<K> {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and records `now` for `key` if `cooldown` has elapsed
    /// since the key was last acquired.
    pub fn try_acquire(&self, key: &K, cooldown: Duration, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let ready = last
            .get(key)
            .map_or(true, |t| now.saturating_duration_since(*t) >= cooldown);
        if ready {
            last.insert(key.clone(), now);
        }
        ready
    }

    pub fn last(&self, key: &K) -> Option<Instant> {
        self.last
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied()
    }

    pub fn reset(&self) {
        self.last.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_first_acquire_passes() {
        let t = Throttle::new(Duration::from_millis(500));
        assert!(t.try_acquire(Instant::now()));
    }

    #[test]
    fn test_throttle_blocks_within_interval() {
        let t = Throttle::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(t.try_acquire(t0));
        assert!(!t.try_acquire(t0 + Duration::from_millis(499)));
        assert!(t.try_acquire(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_throttle_zero_interval_always_passes() {
        let t = Throttle::new(Duration::ZERO);
        let t0 = Instant::now();
        assert!(t.try_acquire(t0));
        assert!(t.try_acquire(t0));
    }

    #[test]
    fn test_keyed_throttle_keys_are_independent() {
        let t = KeyedThrottle::new();
        let t0 = Instant::now();
        let cd = Duration::from_secs(1);
        assert!(t.try_acquire(&"alice", cd, t0));
        assert!(t.try_acquire(&"bob", cd, t0));
        assert!(!t.try_acquire(&"alice", cd, t0 + Duration::from_millis(10)));
        assert_eq!(t.last(&"alice"), Some(t0));
    }

    #[test]
    fn test_keyed_throttle_reset() {
        let t = KeyedThrottle::new();
        let t0 = Instant::now();
        assert!(t.try_acquire(&1u8, Duration::from_secs(60), t0));
        t.reset();
        assert!(t.try_acquire(&1u8, Duration::from_secs(60), t0));
    }
}
