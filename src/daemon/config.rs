use std::{io::ErrorKind, path::Path, time::Duration};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{signal_api::SignalKind, utils::time::millis};

use super::fusion::FusionThresholds;

pub const SETTINGS_FILE: &str = "settings.json";

/// Settings read once when the monitor is constructed. Every field has a default so a partial
/// settings file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Quiet period after which Active becomes Idle.
    pub active_threshold_ms: u64,
    /// Quiet period after which Idle becomes Inactive.
    pub idle_timeout_ms: u64,
    pub idle_poll_ms: u64,
    pub window_poll_ms: u64,
    pub pointer_poll_ms: u64,
    /// Re-evaluation of thresholds when no samples arrive.
    pub evaluation_tick_ms: u64,
    pub status_interval_ms: u64,
    pub persist_interval_ms: u64,
    pub gap_fill_window_minutes: u32,
    /// Bound on the single read each adapter gets while permissions are probed.
    pub probe_timeout_ms: u64,
    pub track_idle: bool,
    pub track_window: bool,
    pub track_pointer: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            active_threshold_ms: 5_000,
            idle_timeout_ms: 5 * 60 * 1000,
            idle_poll_ms: 1_000,
            window_poll_ms: 2_000,
            pointer_poll_ms: 500,
            evaluation_tick_ms: 10_000,
            status_interval_ms: 5_000,
            persist_interval_ms: 60_000,
            gap_fill_window_minutes: 30,
            probe_timeout_ms: 2_000,
            track_idle: true,
            track_window: true,
            track_pointer: true,
        }
    }
}

impl MonitorConfig {
    /// Reads settings from `path`. A missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<MonitorConfig>(&content)
                .with_context(|| format!("Failed to parse settings {path:?}"))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No settings at {path:?}, using defaults");
                MonitorConfig::default()
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read settings {path:?}")),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("idle_poll_ms", self.idle_poll_ms),
            ("window_poll_ms", self.window_poll_ms),
            ("pointer_poll_ms", self.pointer_poll_ms),
            ("evaluation_tick_ms", self.evaluation_tick_ms),
            ("status_interval_ms", self.status_interval_ms),
            ("persist_interval_ms", self.persist_interval_ms),
            ("active_threshold_ms", self.active_threshold_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            bail!("{name} must be greater than zero");
        }
        if self.active_threshold_ms >= self.idle_timeout_ms {
            bail!(
                "active_threshold_ms ({}) must be lower than idle_timeout_ms ({})",
                self.active_threshold_ms,
                self.idle_timeout_ms
            );
        }
        Ok(())
    }

    pub fn thresholds(&self) -> FusionThresholds {
        FusionThresholds {
            active_threshold: millis(self.active_threshold_ms),
            idle_timeout: millis(self.idle_timeout_ms),
        }
    }

    pub fn poll_interval(&self, kind: SignalKind) -> Duration {
        Duration::from_millis(match kind {
            SignalKind::Idle => self.idle_poll_ms,
            SignalKind::Window => self.window_poll_ms,
            SignalKind::Pointer => self.pointer_poll_ms,
        })
    }

    pub fn is_tracked(&self, kind: SignalKind) -> bool {
        match kind {
            SignalKind::Idle => self.track_idle,
            SignalKind::Window => self.track_window,
            SignalKind::Pointer => self.track_pointer,
        }
    }

    pub fn evaluation_tick(&self) -> Duration {
        Duration::from_millis(self.evaluation_tick_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn gap_fill_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.gap_fill_window_minutes))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use tempfile::tempdir;

    use crate::signal_api::SignalKind;

    use super::MonitorConfig;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempdir()?;
        let config = MonitorConfig::load(&dir.path().join("settings.json"))?;
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.poll_interval(SignalKind::Pointer), Duration::from_millis(500));
        assert_eq!(config.poll_interval(SignalKind::Idle), Duration::from_secs(1));
        assert_eq!(config.poll_interval(SignalKind::Window), Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "idle_timeout_ms": 600000, "track_pointer": false }"#)?;

        let config = MonitorConfig::load(&path)?;

        assert_eq!(config.idle_timeout_ms, 600_000);
        assert!(!config.is_tracked(SignalKind::Pointer));
        assert!(config.is_tracked(SignalKind::Window));
        assert_eq!(config.active_threshold_ms, 5_000);
        Ok(())
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = MonitorConfig {
            active_threshold_ms: 10_000,
            idle_timeout_ms: 5_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_intervals() {
        let config = MonitorConfig {
            pointer_poll_ms: 0,
            ..Default::default()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("pointer_poll_ms"));
    }
}
