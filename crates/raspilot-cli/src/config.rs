//! Settings file – `~/.raspilot/config.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! Environment variables override the file:
//!
//! | Variable | Field |
//! |---|---|
//! | `RASPILOT_LOG` | `log_level` |
//! | `RASPILOT_PANIC_THRESHOLD` | `watchdog.panic_threshold` |
//! | `RASPILOT_CALM_THRESHOLD` | `watchdog.calm_threshold` |
//! | `RASPILOT_TELEMETRY_INTERVAL_MS` | `intervals.telemetry_ms` |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use raspilot_kernel::{KernelConfig, LoadMonitor, WatchdogConfig};
use raspilot_types::KernelError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    pub log_level: String,
    pub watchdog: WatchdogSection,
    pub intervals: IntervalSection,
    pub simulation: SimulationSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub panic_threshold: f32,
    pub calm_threshold: f32,
    pub panic_delay_ms: u64,
    pub calm_down_delay_ms: u64,
    pub emit_status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalSection {
    pub telemetry_ms: u64,
    pub black_box_ms: u64,
    pub load_guard_ms: u64,
    /// Consecutive failing recorder ticks before the recorder is declared
    /// degraded.  `0` never gives up.
    pub tick_error_ceiling: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    /// Register the simulated IMU, receiver and flight controller.
    pub enabled: bool,
    pub imu_ms: u64,
    pub rx_ms: u64,
    pub control_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            watchdog: WatchdogSection::default(),
            intervals: IntervalSection::default(),
            simulation: SimulationSection::default(),
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        let defaults = WatchdogConfig::default();
        Self {
            panic_threshold: defaults.panic_threshold,
            calm_threshold: defaults.calm_threshold,
            panic_delay_ms: defaults.panic_delay_ms,
            calm_down_delay_ms: defaults.calm_down_delay_ms,
            emit_status: defaults.emit_status,
        }
    }
}

impl Default for IntervalSection {
    fn default() -> Self {
        Self {
            telemetry_ms: 200,
            black_box_ms: 500,
            load_guard_ms: 100,
            tick_error_ceiling: 10,
        }
    }
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            imu_ms: 20,
            rx_ms: 50,
            control_ms: 20,
        }
    }
}

impl Config {
    /// # Errors
    ///
    /// [`KernelError::InvalidThresholds`] unless calm < panic, and
    /// [`KernelError::InvalidConfig`] for a zero recorder or simulation
    /// interval.
    pub fn validate(&self) -> Result<(), KernelError> {
        LoadMonitor::new(self.watchdog.panic_threshold, self.watchdog.calm_threshold)?;
        let intervals = [
            ("intervals.telemetry_ms", self.intervals.telemetry_ms),
            ("intervals.black_box_ms", self.intervals.black_box_ms),
            ("intervals.load_guard_ms", self.intervals.load_guard_ms),
            ("simulation.imu_ms", self.simulation.imu_ms),
            ("simulation.rx_ms", self.simulation.rx_ms),
            ("simulation.control_ms", self.simulation.control_ms),
        ];
        match intervals.iter().find(|(_, ms)| *ms == 0) {
            Some((field, _)) => Err(KernelError::InvalidConfig(format!(
                "{field} must be at least 1 ms"
            ))),
            None => Ok(()),
        }
    }

    pub fn kernel_config(&self) -> KernelConfig {
        KernelConfig {
            telemetry_interval: Duration::from_millis(self.intervals.telemetry_ms),
            black_box_interval: Duration::from_millis(self.intervals.black_box_ms),
            load_guard_interval: Duration::from_millis(self.intervals.load_guard_ms),
            tick_error_ceiling: Some(self.intervals.tick_error_ceiling).filter(|c| *c > 0),
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            panic_threshold: self.watchdog.panic_threshold,
            calm_threshold: self.watchdog.calm_threshold,
            panic_delay_ms: self.watchdog.panic_delay_ms,
            calm_down_delay_ms: self.watchdog.calm_down_delay_ms,
            emit_status: self.watchdog.emit_status,
        }
    }
}

/// `~/.raspilot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".raspilot").join("config.toml")
}

/// Parse the file at `path`.  `Ok(None)` when it does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {e}", path.display()))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse {}: {e}", path.display()))
}

/// File (or defaults), then environment overrides, then validation.
pub fn resolve(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Unparseable values are ignored.
pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("RASPILOT_LOG") {
        cfg.log_level = v;
    }
    if let Some(v) = lookup("RASPILOT_PANIC_THRESHOLD")
        && let Ok(threshold) = v.trim().parse::<f32>()
    {
        cfg.watchdog.panic_threshold = threshold;
    }
    if let Some(v) = lookup("RASPILOT_CALM_THRESHOLD")
        && let Ok(threshold) = v.trim().parse::<f32>()
    {
        cfg.watchdog.calm_threshold = threshold;
    }
    if let Some(v) = lookup("RASPILOT_TELEMETRY_INTERVAL_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.intervals.telemetry_ms = ms;
    }
}

/// Write `cfg` to `path`, creating the parent directory.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {e}"))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {e}"))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_kernel_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.kernel_config(), KernelConfig::default());
        assert_eq!(cfg.watchdog_config(), WatchdogConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[watchdog]\npanic_threshold = 90.0\n").unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.watchdog.panic_threshold, 90.0);
        assert_eq!(cfg.watchdog.calm_threshold, 70.0);
        assert_eq!(cfg.intervals.telemetry_ms, 200);
        assert!(cfg.simulation.enabled);
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let mut cfg = Config::default();
        cfg.intervals.black_box_ms = 1000;
        cfg.simulation.enabled = false;
        save_to(&cfg, &path).expect("save");
        assert_eq!(load_from(&path).expect("load ok"), Some(cfg));
    }

    #[test]
    fn missing_file_is_none_and_resolves_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert_eq!(load_from(&path).expect("no error"), None);
        assert!(resolve(&path).is_ok());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "watchdog = [not toml").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("RASPILOT_LOG", "debug"),
                ("RASPILOT_PANIC_THRESHOLD", "92.5"),
                ("RASPILOT_CALM_THRESHOLD", "not-a-number"),
                ("RASPILOT_TELEMETRY_INTERVAL_MS", " 50 "),
            ]),
        );
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.watchdog.panic_threshold, 92.5);
        assert_eq!(cfg.watchdog.calm_threshold, 70.0);
        assert_eq!(cfg.intervals.telemetry_ms, 50);
    }

    #[test]
    fn inverted_thresholds_fail_validation() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, env(&[("RASPILOT_CALM_THRESHOLD", "90")]));
        assert!(matches!(
            cfg.validate(),
            Err(KernelError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn zero_telemetry_interval_from_env_is_rejected() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, env(&[("RASPILOT_TELEMETRY_INTERVAL_MS", "0")]));
        assert_eq!(cfg.intervals.telemetry_ms, 0);
        match cfg.validate() {
            Err(KernelError::InvalidConfig(reason)) => {
                assert!(reason.contains("intervals.telemetry_ms"), "{reason}");
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn zero_interval_in_file_fails_resolve() {
        for section in [
            "[intervals]\nblack_box_ms = 0\n",
            "[intervals]\nload_guard_ms = 0\n",
            "[simulation]\nimu_ms = 0\n",
        ] {
            let dir = tempfile::tempdir().expect("tmp dir");
            let path = dir.path().join("config.toml");
            fs::write(&path, section).unwrap();
            let err = resolve(&path).expect_err(section);
            assert!(err.contains("at least 1 ms"), "{err}");
        }
    }

    #[test]
    fn zero_ceiling_means_unlimited() {
        let mut cfg = Config::default();
        cfg.intervals.tick_error_ceiling = 0;
        assert_eq!(cfg.kernel_config().tick_error_ceiling, None);
    }

    #[test]
    fn config_path_points_to_raspilot_dir() {
        let p = config_path_for_home("/home/pilot");
        assert_eq!(p, PathBuf::from("/home/pilot/.raspilot/config.toml"));
    }
}
