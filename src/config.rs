//! Pipeline configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/frame_acq.toml`)
//! 2. environment variables prefixed with `FRAME_ACQ_`, using `__` between
//!    section and key (e.g. `FRAME_ACQ_SCHEDULER__PERIOD=10ms`)
//!
//! Every field has a default, so an empty or missing file yields
//! [`AcqConfig::default()`]. Durations use humantime syntax (`"1s"`, `"50ms"`).
//!
//! # Example
//! ```no_run
//! use frame_acq::config::AcqConfig;
//!
//! let config = AcqConfig::load_from("config/frame_acq.toml")?;
//! println!("Scheduler period: {:?}", config.scheduler.period);
//! # Ok::<(), frame_acq::error::AcqError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::buffer::MAX_BUFFERS;
use crate::error::{AcqError, AcqResult};
use crate::logging::LoggingConfig;
use crate::settings::CameraSettings;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/frame_acq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FRAME_ACQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcqConfig {
    /// Periodic drain task
    pub scheduler: SchedulerConfig,
    /// Buffer allocation defaults
    pub pool: PoolConfig,
    /// In-memory frame store
    pub store: StoreConfig,
    /// Bounded lock shared by scheduler and API calls
    pub lock: LockConfig,
    /// Session lifecycle limits
    pub session: SessionConfig,
    /// Camera settings applied at startup
    pub camera: CameraSettings,
    /// Log output
    pub logging: LoggingConfig,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick period (minimum 1 ms)
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// How long one poll may wait for a transfer; zero polls without waiting
    #[serde(with = "humantime_serde")]
    pub poll_wait: Duration,
    /// Poll/drain rounds per tick
    pub buffer_runs: u32,
    /// Stalled ticks tolerated before buffers are rebuilt (0 disables)
    pub buffer_fix_threshold: u32,
    /// Interval between scheduled health checks
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Do not spawn the periodic task; ticks are driven through `Pipeline::tick`
    pub manual: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            poll_wait: Duration::from_millis(10),
            buffer_runs: 2,
            buffer_fix_threshold: 10,
            health_check_interval: Duration::from_secs(5),
            manual: false,
        }
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers allocated by `start()` when none were allocated explicitly
    pub default_buffer_count: usize,
    /// Image slots per buffer
    pub images_per_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_buffer_count: 4,
            images_per_buffer: 1,
        }
    }
}

/// Frame store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Frames reserved up front
    pub initial_capacity: usize,
    /// Frames added per extension
    pub extension_chunk: usize,
    /// Soft limit for stored payloads in MiB (0 = no limit)
    pub memory_limit_mib: u64,
    /// Keep drained frames in the store (otherwise only the sink sees them)
    pub store_in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            extension_chunk: 1024,
            memory_limit_mib: 4096,
            store_in_memory: true,
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Foreground `try_lock` retries before `Busy`
    pub retries: u32,
    /// Sleep between retries
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: 50,
            retry_interval: Duration::from_millis(10),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long `stop()` waits for the drain to finish
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    /// Stop after this many frames (0 = unlimited)
    pub max_frames: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            max_frames: 0,
        }
    }
}

impl AcqConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AcqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AcqResult<()> {
        if self.scheduler.period < Duration::from_millis(1) {
            return Err(AcqError::Configuration(format!(
                "Invalid scheduler.period {:?}. Must be at least 1ms",
                self.scheduler.period
            )));
        }
        if self.scheduler.buffer_runs == 0 {
            return Err(AcqError::Configuration(
                "Invalid scheduler.buffer_runs 0. Must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_BUFFERS).contains(&self.pool.default_buffer_count) {
            return Err(AcqError::Configuration(format!(
                "Invalid pool.default_buffer_count {}. Must be 1-{}",
                self.pool.default_buffer_count, MAX_BUFFERS
            )));
        }
        if self.pool.images_per_buffer == 0 {
            return Err(AcqError::Configuration(
                "Invalid pool.images_per_buffer 0. Must be at least 1".to_string(),
            ));
        }
        if self.store.extension_chunk == 0 {
            return Err(AcqError::Configuration(
                "Invalid store.extension_chunk 0. Must be at least 1".to_string(),
            ));
        }
        self.logging.validate()?;
        self.camera.validate()?;
        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> AcqResult<String> {
        toml::to_string_pretty(self).map_err(|e| AcqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AcqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.period, Duration::from_secs(1));
        assert_eq!(config.session.max_frames, 0);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AcqConfig::default();
        config.scheduler.period = Duration::from_micros(500);
        assert!(config.validate().is_err());

        let mut config = AcqConfig::default();
        config.scheduler.buffer_runs = 0;
        assert!(config.validate().is_err());

        let mut config = AcqConfig::default();
        config.pool.default_buffer_count = MAX_BUFFERS + 1;
        assert!(config.validate().is_err());

        let mut config = AcqConfig::default();
        config.store.extension_chunk = 0;
        assert!(config.validate().is_err());

        let mut config = AcqConfig::default();
        config.pool.images_per_buffer = 0;
        assert!(matches!(config.validate(), Err(AcqError::Configuration(_))));
    }

    #[test]
    fn toml_round_trip_keeps_humantime_durations() {
        let mut config = AcqConfig::default();
        config.scheduler.poll_wait = Duration::from_millis(50);
        let text = config.to_toml().unwrap();
        assert!(text.contains("poll_wait = \"50ms\""));
        let parsed: AcqConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
