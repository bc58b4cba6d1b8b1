//! Camera health decoding and periodic monitoring.
//!
//! The device reports three bitmask registers. Each is decoded against a
//! static `(name, mask)` table; any bit set in the error register makes the
//! snapshot fatal. Warnings are logged once per change and otherwise only
//! exposed through snapshots.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::driver::{HealthSource, RawHealth, RawTemperatures};
use crate::error::AcqResult;

/// Fatal error conditions.
pub static ERROR_FLAGS: &[(&str, u32)] = &[
    ("power_supply_voltage_range", 0x0000_0001),
    ("power_supply_temperature", 0x0000_0002),
    ("camera_temperature", 0x0000_0004),
    ("sensor_temperature", 0x0000_0008),
    ("external_battery_low", 0x0000_0010),
    ("camera_interface", 0x0001_0000),
    ("camera_ram", 0x0002_0000),
    ("camera_mainboard", 0x0004_0000),
    ("camera_headboard", 0x0008_0000),
];

/// Non-fatal warning conditions.
pub static WARNING_FLAGS: &[(&str, u32)] = &[
    ("power_supply_voltage_range", 0x0000_0001),
    ("power_supply_temperature", 0x0000_0002),
    ("camera_temperature", 0x0000_0004),
    ("sensor_temperature", 0x0000_0008),
    ("external_battery_low", 0x0000_0010),
    ("offset_regulation_range", 0x0000_0020),
];

/// Informational status flags.
pub static STATUS_FLAGS: &[(&str, u32)] = &[
    ("default_state", 0x0000_0001),
    ("settings_valid", 0x0000_0002),
    ("recording_on", 0x0000_0004),
    ("read_image_on", 0x0000_0008),
    ("frame_rate_valid", 0x0000_0010),
    ("sequence_stop_triggered", 0x0000_0020),
    ("locked_to_external_sync", 0x0000_0040),
    ("external_battery_available", 0x0000_0080),
    ("power_save", 0x0000_0100),
    ("power_save_left", 0x0000_0200),
    ("locked_to_irig", 0x0000_0400),
];

/// Names of the table entries whose mask is set in `bits`, in table order.
pub fn decode_mask(table: &[(&'static str, u32)], bits: u32) -> Vec<&'static str> {
    table
        .iter()
        .filter(|(_, mask)| bits & mask != 0)
        .map(|(name, _)| *name)
        .collect()
}

/// Temperatures in degrees Celsius; `None` when the sensor is not available.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Temperatures {
    /// Image sensor.
    pub sensor: Option<f64>,
    /// Camera electronics.
    pub camera: Option<f64>,
    /// Power supply.
    pub power_supply: Option<f64>,
}

impl From<RawTemperatures> for Temperatures {
    fn from(raw: RawTemperatures) -> Self {
        fn convert(tenths: i16) -> Option<f64> {
            (tenths != RawTemperatures::UNAVAILABLE).then(|| f64::from(tenths) / 10.0)
        }
        Self {
            sensor: convert(raw.sensor),
            camera: convert(raw.camera),
            power_supply: convert(raw.power_supply),
        }
    }
}

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthLevel {
    /// No errors, no warnings
    Healthy,
    /// Warnings only
    Degraded,
    /// At least one error condition
    Critical,
}

/// Decoded health registers at one point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HealthSnapshot {
    /// Active error conditions.
    pub errors: Vec<&'static str>,
    /// Active warnings.
    pub warnings: Vec<&'static str>,
    /// Status flags that are set.
    pub status: Vec<&'static str>,
    /// Temperatures at read time.
    pub temperatures: Temperatures,
}

impl HealthSnapshot {
    /// Decode raw registers into named conditions.
    pub fn from_raw(raw: &RawHealth) -> Self {
        Self {
            errors: decode_mask(ERROR_FLAGS, raw.errors),
            warnings: decode_mask(WARNING_FLAGS, raw.warnings),
            status: decode_mask(STATUS_FLAGS, raw.status),
            temperatures: raw.temperatures.into(),
        }
    }

    /// Any error condition ends a run.
    pub fn is_fatal(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Overall rating.
    pub fn level(&self) -> HealthLevel {
        if self.is_fatal() {
            HealthLevel::Critical
        } else if !self.warnings.is_empty() {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }

    /// Error names as owned strings, for error values.
    pub fn error_names(&self) -> Vec<String> {
        self.errors.iter().map(|s| (*s).to_string()).collect()
    }
}

/// Interval-driven health poller.
#[derive(Debug)]
pub struct HealthMonitor {
    interval: Duration,
    last_check: Option<Instant>,
    last_warnings: Vec<&'static str>,
    last_snapshot: Option<HealthSnapshot>,
}

impl HealthMonitor {
    /// Monitor that checks at most once per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_check: None,
            last_warnings: Vec::new(),
            last_snapshot: None,
        }
    }

    /// Minimum time between checks.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a scheduled check is due. The first check is always due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_check {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Read and decode the device health without touching the schedule.
    pub async fn snapshot(&mut self, source: &dyn HealthSource) -> AcqResult<HealthSnapshot> {
        let raw = source.read_health().await?;
        let snapshot = HealthSnapshot::from_raw(&raw);
        self.note(&snapshot);
        Ok(snapshot)
    }

    /// Scheduled check: read health and restart the interval.
    pub async fn check(&mut self, source: &dyn HealthSource) -> AcqResult<HealthSnapshot> {
        self.last_check = Some(Instant::now());
        self.snapshot(source).await
    }

    /// Most recent snapshot, if any check ran.
    pub fn last(&self) -> Option<&HealthSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Forget the schedule so the next tick checks immediately.
    pub fn reset(&mut self) {
        self.last_check = None;
    }

    fn note(&mut self, snapshot: &HealthSnapshot) {
        if snapshot.is_fatal() {
            error!(errors = ?snapshot.errors, "Camera reports health errors");
        }
        if snapshot.warnings != self.last_warnings {
            if snapshot.warnings.is_empty() {
                debug!("Camera health warnings cleared");
            } else {
                warn!(
                    warnings = ?snapshot.warnings,
                    sensor_c = ?snapshot.temperatures.sensor,
                    "Camera health warnings changed"
                );
            }
            self.last_warnings = snapshot.warnings.clone();
        }
        self.last_snapshot = Some(snapshot.clone());
    }
}
