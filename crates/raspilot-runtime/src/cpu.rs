//! CPU utilization from `/proc/stat`.
//!
//! The aggregate `cpu` line holds cumulative jiffies per state.  Utilization
//! is the busy share of the jiffies elapsed between two reads; the first
//! read measures since boot.

use std::fs;
use std::path::PathBuf;

use raspilot_kernel::MetricSampler;
use raspilot_types::KernelError;

/// Cumulative jiffies from one `cpu` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub idle: u64,
}

impl CpuTimes {
    /// Parse the aggregate `cpu` line out of a `/proc/stat` dump.
    pub fn parse(stat: &str) -> Result<Self, KernelError> {
        let line = stat
            .lines()
            .find(|l| l.split_whitespace().next() == Some("cpu"))
            .ok_or_else(|| KernelError::Io("no aggregate cpu line in /proc/stat".to_string()))?;

        let fields = line
            .split_whitespace()
            .skip(1)
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| KernelError::Io(format!("malformed cpu line: {e}")))?;
        if fields.len() < 4 {
            return Err(KernelError::Io(format!(
                "cpu line has {} fields, expected at least 4",
                fields.len()
            )));
        }

        // user nice system idle iowait irq softirq steal [guest guest_nice]
        // guest time is already counted in user/nice.
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().take(8).sum();
        Ok(Self {
            busy: total.saturating_sub(idle),
            idle,
        })
    }

    /// Busy percentage of the interval `previous` → `self`, 0–100.
    pub fn utilization_since(&self, previous: &CpuTimes) -> f32 {
        let busy = self.busy.saturating_sub(previous.busy);
        let idle = self.idle.saturating_sub(previous.idle);
        let total = busy + idle;
        if total == 0 {
            0.0
        } else {
            (busy as f64 * 100.0 / total as f64) as f32
        }
    }
}

/// Load guard sampler backed by `/proc/stat`.
///
/// On hosts without procfs every sample fails with [`KernelError::Io`] and
/// the periodic task's error handling applies.
pub struct ProcStatSampler {
    path: PathBuf,
    previous: Option<CpuTimes>,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            previous: None,
        }
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSampler for ProcStatSampler {
    fn sample(&mut self) -> Result<f32, KernelError> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| KernelError::Io(format!("{}: {e}", self.path.display())))?;
        let current = CpuTimes::parse(&raw)?;
        let previous = self.previous.replace(current).unwrap_or_default();
        Ok(current.utilization_since(&previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const STAT: &str = "cpu  100 0 50 800 50 0 0 0 0 0\n\
                        cpu0 50 0 25 400 25 0 0 0 0 0\n\
                        intr 12345\n";

    #[test]
    fn parses_aggregate_line() {
        let times = CpuTimes::parse(STAT).unwrap();
        assert_eq!(times, CpuTimes { busy: 150, idle: 850 });
    }

    #[test]
    fn rejects_missing_or_short_line() {
        assert!(matches!(CpuTimes::parse("intr 1\n"), Err(KernelError::Io(_))));
        assert!(CpuTimes::parse("cpu 1 2\n").is_err());
        assert!(CpuTimes::parse("cpu 1 2 x 4\n").is_err());
    }

    #[test]
    fn utilization_uses_deltas() {
        let before = CpuTimes { busy: 100, idle: 900 };
        let after = CpuTimes { busy: 190, idle: 910 };
        assert!((after.utilization_since(&before) - 90.0).abs() < 1e-3);
        assert_eq!(after.utilization_since(&after), 0.0);
    }

    #[test]
    fn sampler_tracks_previous_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{STAT}").unwrap();
        let mut sampler = ProcStatSampler::with_path(file.path());
        assert!((sampler.sample().unwrap() - 15.0).abs() < 1e-3);

        fs::write(file.path(), "cpu  160 0 70 820 50 0 0 0 0 0\n").unwrap();
        assert!((sampler.sample().unwrap() - 80.0).abs() < 1e-3);
    }

    #[test]
    fn missing_file_is_io_error() {
        let mut sampler = ProcStatSampler::with_path("/definitely/not/proc/stat");
        assert!(matches!(sampler.sample(), Err(KernelError::Io(_))));
    }
}
