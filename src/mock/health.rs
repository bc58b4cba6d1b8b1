//! Simulated health source with settable registers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::driver::{DriverError, HealthSource, RawHealth, RawTemperatures};

/// Health source whose registers are set by the test.
pub struct MockHealth {
    errors: AtomicU32,
    warnings: AtomicU32,
    status: AtomicU32,
    temperatures: Mutex<RawTemperatures>,
    fail_code: AtomicU32,
    reads: AtomicU64,
}

impl Default for MockHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHealth {
    /// Healthy camera at 20.0 °C sensor / 30.0 °C body, no power supply sensor.
    pub fn new() -> Self {
        Self {
            errors: AtomicU32::new(0),
            warnings: AtomicU32::new(0),
            status: AtomicU32::new(0x2),
            temperatures: Mutex::new(RawTemperatures {
                sensor: 200,
                camera: 300,
                power_supply: RawTemperatures::UNAVAILABLE,
            }),
            fail_code: AtomicU32::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Set the error register.
    pub fn set_errors(&self, bits: u32) {
        self.errors.store(bits, Ordering::SeqCst);
    }

    /// Set the warning register.
    pub fn set_warnings(&self, bits: u32) {
        self.warnings.store(bits, Ordering::SeqCst);
    }

    /// Set the status register.
    pub fn set_status(&self, bits: u32) {
        self.status.store(bits, Ordering::SeqCst);
    }

    /// Set reported temperatures.
    pub fn set_temperatures(&self, temperatures: RawTemperatures) {
        *self.temperatures.lock() = temperatures;
    }

    /// Fail the next read with `code`.
    pub fn fail_next(&self, code: u32) {
        self.fail_code.store(code, Ordering::SeqCst);
    }

    /// Number of successful and failed reads so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthSource for MockHealth {
    async fn read_health(&self) -> Result<RawHealth, DriverError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let code = self.fail_code.swap(0, Ordering::SeqCst);
        if code != 0 {
            return Err(DriverError::new(code));
        }
        Ok(RawHealth {
            errors: self.errors.load(Ordering::SeqCst),
            warnings: self.warnings.load(Ordering::SeqCst),
            status: self.status.load(Ordering::SeqCst),
            temperatures: *self.temperatures.lock(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::codes;

    #[tokio::test]
    async fn registers_and_failures() {
        let health = MockHealth::new();
        health.set_errors(0x8);
        let raw = health.read_health().await.unwrap();
        assert_eq!(raw.errors, 0x8);
        assert_eq!(raw.temperatures.sensor, 200);

        health.fail_next(codes::NOT_CONNECTED);
        assert!(health.read_health().await.is_err());
        assert!(health.read_health().await.is_ok());
        assert_eq!(health.reads(), 3);
    }
}
