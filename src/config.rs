//! Layered configuration using Figment.
//!
//! Configuration is assembled from, lowest to highest precedence:
//! 1. built-in defaults ([`XafsConfig::default`])
//! 2. a TOML file (`config/xafs_daq.toml` unless another path is given)
//! 3. environment variables prefixed with `XAFSDAQ_`, `__` separating sections
//!
//! ```text
//! XAFSDAQ_APPLICATION__LOG_LEVEL=debug
//! XAFSDAQ_BUS__VIEWER_PORT=6301
//! XAFSDAQ_PIPELINE__HISTORY_DEPTH=5
//! ```
//!
//! ```no_run
//! use xafs_daq::config::XafsConfig;
//!
//! let config = XafsConfig::load().unwrap();
//! println!("viewer publishes on {}", config.bus.viewer_port);
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/xafs_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "XAFSDAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct XafsConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Event bus transport.
    pub bus: BusConfig,
    /// Device I/O bounds.
    pub hardware: HardwareConfig,
    /// Fly-scan protocol timings.
    pub flyer: FlyerConfig,
    /// Step/fly scan orchestration.
    pub scan: ScanConfig,
    /// Live data pipeline.
    pub pipeline: PipelineConfig,
    /// In-memory run store.
    pub store: StoreConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "XAFS DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Host both halves bind/connect on.
    pub host: String,
    /// Port the controller publishes on (viewer subscribes).
    pub controller_port: u16,
    /// Port the viewer publishes on (controller subscribes).
    pub viewer_port: u16,
    /// Per-subscriber queue length before messages are dropped.
    pub queue_capacity: usize,
    /// Delay before a dropped subscriber reconnects.
    pub reconnect_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            controller_port: 5201,
            viewer_port: 5301,
            queue_capacity: 256,
            reconnect_delay_ms: 500,
        }
    }
}

impl BusConfig {
    /// `host:port` the controller publishes on.
    pub fn controller_addr(&self) -> String {
        format!("{}:{}", self.host, self.controller_port)
    }

    /// `host:port` the viewer publishes on.
    pub fn viewer_addr(&self) -> String {
        format!("{}:{}", self.host, self.viewer_port)
    }

    /// Reconnect delay as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Device I/O configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Per-operation timeout.
    pub io_timeout_ms: u64,
    /// Attempts per read, including the first.
    pub read_retries: u32,
    /// Delay between read attempts.
    pub retry_delay_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: 1000,
            read_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl HardwareConfig {
    /// I/O timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Flyer protocol timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlyerConfig {
    /// Watcher polling interval for the motion-done flag.
    pub poll_interval_ms: u64,
    /// Consecutive "done" readings needed before motion counts as finished.
    pub steady_polls: u32,
    /// Settle time after resetting the capture counters.
    pub reset_settle_ms: u64,
    /// Settle time between enabling capture and issuing the move.
    pub kickoff_settle_ms: u64,
    /// Default wait for the completion signal.
    pub completion_timeout_ms: u64,
}

impl Default for FlyerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            steady_polls: 2,
            reset_settle_ms: 200,
            kickoff_settle_ms: 200,
            completion_timeout_ms: 600_000,
        }
    }
}

impl FlyerConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Completion timeout as a [`Duration`].
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

/// Scan orchestration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Pre-positioning offset below the first point, eV.
    pub pre_position_offset_ev: f64,
    /// Settle after pre-positioning.
    pub pre_position_settle_ms: u64,
    /// Settle after moving onto the first point.
    pub start_settle_ms: u64,
    /// Wait after every step move before counting.
    pub post_move_delay_ms: u64,
    /// Shutter-closed counting time for dark current, seconds.
    pub dark_preset_s: f64,
    /// Wait between fly-scan repeats.
    pub fly_cooling_ms: u64,
    /// Interval between viewer updates while a sweep is in flight.
    pub fly_update_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            pre_position_offset_ev: 200.0,
            pre_position_settle_ms: 1000,
            start_settle_ms: 2000,
            post_move_delay_ms: 0,
            dark_preset_s: 10.0,
            fly_cooling_ms: 0,
            fly_update_interval_ms: 500,
        }
    }
}

impl ScanConfig {
    /// Live update interval as a [`Duration`].
    pub fn fly_update_interval(&self) -> Duration {
        Duration::from_millis(self.fly_update_interval_ms)
    }
}

/// Live data pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of most recent runs overlaid on the plot (1..=10).
    pub history_depth: usize,
    /// Pause before reading live waveforms during a fly scan.
    pub live_read_delay_ms: u64,
    /// Ratio applied to the last I0 value for the second DCM readback.
    pub align_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_depth: 1,
            live_read_delay_ms: 200,
            align_ratio: 0.7,
        }
    }
}

/// Run store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Runs kept in memory before the oldest closed ones are evicted.
    pub retained_runs: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retained_runs: crate::store::DEFAULT_RETAINED_RUNS,
        }
    }
}

impl XafsConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path; a missing file leaves defaults.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Config`] when the sources cannot be merged or extracted and
    /// [`DaqError::Configuration`] when validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Bus ports are distinct and the queue holds at least one message
    /// - History depth is within 1..=10 and the store retains at least that many runs
    /// - Polling and retry counts are non-zero
    /// - The live fly update interval is non-zero
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.bus.controller_port == self.bus.viewer_port {
            return Err(DaqError::Configuration(format!(
                "controller_port and viewer_port must differ (both {})",
                self.bus.controller_port
            )));
        }
        if self.bus.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "bus queue_capacity must be > 0".to_string(),
            ));
        }

        if self.hardware.read_retries == 0 || self.hardware.io_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "hardware read_retries and io_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.flyer.poll_interval_ms == 0 || self.flyer.steady_polls == 0 {
            return Err(DaqError::Configuration(
                "flyer poll_interval_ms and steady_polls must be > 0".to_string(),
            ));
        }

        if !(1..=10).contains(&self.pipeline.history_depth) {
            return Err(DaqError::Configuration(format!(
                "Invalid history_depth {}. Must be 1-10",
                self.pipeline.history_depth
            )));
        }

        if self.store.retained_runs < self.pipeline.history_depth {
            return Err(DaqError::Configuration(format!(
                "store retained_runs {} is below history_depth {}",
                self.store.retained_runs, self.pipeline.history_depth
            )));
        }

        if !(self.scan.dark_preset_s > 0.0) {
            return Err(DaqError::Configuration(
                "scan dark_preset_s must be > 0".to_string(),
            ));
        }
        if self.scan.fly_update_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "scan fly_update_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = XafsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.controller_port, 5201);
        assert_eq!(config.bus.viewer_port, 5301);
        assert_eq!(config.pipeline.align_ratio, 0.7);
    }

    #[test]
    #[serial]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
[application]
log_level = "debug"

[pipeline]
history_depth = 4
"#,
        );
        let config = XafsConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.pipeline.history_depth, 4);
        assert_eq!(config.flyer.poll_interval_ms, 100);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = XafsConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, XafsConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[bus]\nviewer_port = 6000\n");
        std::env::set_var("XAFSDAQ_BUS__VIEWER_PORT", "6301");
        let result = XafsConfig::load_from(file.path());
        std::env::remove_var("XAFSDAQ_BUS__VIEWER_PORT");
        assert_eq!(result.unwrap().bus.viewer_port, 6301);
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        let file = write_config("[pipeline]\nhistory_depth = 11\n");
        assert!(matches!(
            XafsConfig::load_from(file.path()),
            Err(DaqError::Configuration(_))
        ));

        let file = write_config("[application]\nlog_level = \"verbose\"\n");
        assert!(matches!(
            XafsConfig::load_from(file.path()),
            Err(DaqError::Configuration(_))
        ));

        let file = write_config("[bus]\ncontroller_port = 5301\n");
        assert!(matches!(
            XafsConfig::load_from(file.path()),
            Err(DaqError::Configuration(_))
        ));

        let file = write_config("[scan]\nfly_update_interval_ms = 0\n");
        assert!(matches!(
            XafsConfig::load_from(file.path()),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_a_load_error() {
        let file = write_config("[bus]\nviewer_port = \"not a port\"\n");
        assert!(matches!(
            XafsConfig::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = XafsConfig::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[pipeline]"));
        let parsed: XafsConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
