//! System load check used by the scheduler to back off under CPU pressure.

use std::path::PathBuf;

pub trait LoadProbe: Send + Sync {
    /// Whether the host is currently too busy for a full recognition pass.
    fn is_high(&self) -> bool;
}

/// Reads the 1-minute load average and compares it per CPU against a
/// threshold.
pub struct LoadAverage {
    path: PathBuf,
    cpus: f32,
    threshold: f32,
}

impl LoadAverage {
    /// Watch `/proc/loadavg`, busy at `threshold` load per CPU.
    pub fn new(threshold: f32) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            path: PathBuf::from("/proc/loadavg"),
            cpus: cpus as f32,
            threshold,
        }
    }

    /// Load per CPU, or `None` if the kernel file is unreadable.
    pub fn per_cpu(&self) -> Option<f32> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        parse_loadavg(&raw).map(|l| l / self.cpus.max(1.0))
    }
}

impl LoadProbe for LoadAverage {
    fn is_high(&self) -> bool {
        self.per_cpu().is_some_and(|l| l >= self.threshold)
    }
}

fn parse_loadavg(raw: &str) -> Option<f32> {
    raw.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("1.50 0.80 0.40 2/345 6789\n"), Some(1.5));
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_loadavg("nope"), None);
    }

    #[test]
    fn test_missing_file_is_not_high() {
        let probe = LoadAverage {
            path: PathBuf::from("/nonexistent/loadavg"),
            cpus: 4.0,
            threshold: 0.85,
        };
        assert!(probe.per_cpu().is_none());
        assert!(!probe.is_high());
    }

    #[test]
    fn test_threshold_is_per_cpu() {
        let path = std::env::temp_dir().join(format!("punch-loadavg-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "3.60 1.00 1.00 1/1 1\n").unwrap();
        let probe = LoadAverage {
            path: path.clone(),
            cpus: 4.0,
            threshold: 0.85,
        };
        assert!(probe.is_high());
        let relaxed = LoadAverage { cpus: 8.0, ..probe };
        assert!(!relaxed.is_high());
        let tolerant = LoadAverage {
            path: path.clone(),
            cpus: 4.0,
            threshold: 1.0,
        };
        assert!(!tolerant.is_high());
        let _ = std::fs::remove_file(&path);
    }
}
