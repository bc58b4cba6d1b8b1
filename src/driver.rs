//! Device-side seams of the pipeline.
//!
//! Three async traits describe everything the pipeline needs from hardware:
//!
//! - [`TransferDriver`] fills buffer regions asynchronously.
//! - [`HealthSource`] reports error/warning/status bitmasks and temperatures.
//! - [`CameraDevice`] is the small control surface the session state machine
//!   drives (settings, recording, recorded image count).
//!
//! Driver failures carry a numeric code. [`DriverCondition`] names the codes
//! the pipeline reacts to; any other code is `Unknown` and treated as fatal.

use std::time::Duration;

use async_trait::async_trait;

use crate::buffer::Region;
use crate::settings::{CameraSettings, ImageDescriptor};

/// Numeric driver status codes.
pub mod codes {
    /// A wait ran past its deadline.
    pub const TIMEOUT: u32 = 0x8000_2001;
    /// The handle has no buffer behind it (already freed).
    pub const BUFFER_UNAVAILABLE: u32 = 0x8000_2002;
    /// A queued transfer was cancelled.
    pub const BUFFER_CANCELLED: u32 = 0x8000_2003;
    /// The handle was never issued by this driver.
    pub const INVALID_HANDLE: u32 = 0x8000_2004;
    /// The transfer failed on the wire.
    pub const TRANSFER_FAILED: u32 = 0x8000_2005;
    /// The camera is not connected.
    pub const NOT_CONNECTED: u32 = 0x8000_2006;
    /// The camera reported a hardware fault.
    pub const HARDWARE_FAULT: u32 = 0x8000_2007;
    /// A parameter was rejected by the camera.
    pub const INVALID_PARAMETER: u32 = 0x8000_2008;
}

/// Named driver condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCondition {
    /// Nothing completed before the deadline.
    Timeout,
    /// No free driver buffer.
    BufferUnavailable,
    /// Transfer was cancelled.
    BufferCancelled,
    /// Handle is unknown to the driver.
    InvalidHandle,
    /// Transfer aborted by the hardware.
    TransferFailed,
    /// Camera is not reachable.
    NotConnected,
    /// Device reported an internal fault.
    HardwareFault,
    /// A parameter was out of range.
    InvalidParameter,
    /// Code has no name.
    Unknown,
}

static CONDITIONS: &[(u32, DriverCondition, &str)] = &[
    (codes::TIMEOUT, DriverCondition::Timeout, "timeout"),
    (codes::BUFFER_UNAVAILABLE, DriverCondition::BufferUnavailable, "buffer unavailable"),
    (codes::BUFFER_CANCELLED, DriverCondition::BufferCancelled, "buffer cancelled"),
    (codes::INVALID_HANDLE, DriverCondition::InvalidHandle, "invalid handle"),
    (codes::TRANSFER_FAILED, DriverCondition::TransferFailed, "transfer failed"),
    (codes::NOT_CONNECTED, DriverCondition::NotConnected, "not connected"),
    (codes::HARDWARE_FAULT, DriverCondition::HardwareFault, "hardware fault"),
    (codes::INVALID_PARAMETER, DriverCondition::InvalidParameter, "invalid parameter"),
];

impl DriverCondition {
    /// Map a raw driver code to its condition.
    pub fn from_code(code: u32) -> Self {
        CONDITIONS
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, condition, _)| *condition)
            .unwrap_or(DriverCondition::Unknown)
    }

    fn label(self) -> &'static str {
        CONDITIONS
            .iter()
            .find(|(_, condition, _)| *condition == self)
            .map(|(_, _, label)| *label)
            .unwrap_or("unknown")
    }
}

impl std::fmt::Display for DriverCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Error reported by a device trait, identified by its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverError {
    /// Raw driver code.
    pub code: u32,
}

impl DriverError {
    /// Wrap a raw code.
    pub fn new(code: u32) -> Self {
        Self { code }
    }

    /// The timeout code.
    pub fn timeout() -> Self {
        Self::new(codes::TIMEOUT)
    }

    /// Named condition for the code.
    pub fn condition(&self) -> DriverCondition {
        DriverCondition::from_code(self.code)
    }

    /// Timeouts are retried rather than treated as failures.
    pub fn is_timeout(&self) -> bool {
        self.condition() == DriverCondition::Timeout
    }

    /// Codes that mean "already free" when returned from a free call.
    pub fn is_benign_on_free(&self) -> bool {
        matches!(
            self.condition(),
            DriverCondition::BufferUnavailable | DriverCondition::BufferCancelled
        )
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Driver {} error (code {:#010x})", self.condition(), self.code)
    }
}

impl std::error::Error for DriverError {}

/// Opaque handle the driver issues for one allocated region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverHandle(pub u64);

impl std::fmt::Display for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Non-blocking status of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStatus {
    /// The transfer is still in flight.
    pub queued: bool,
    /// The transfer completed and the region can be taken back.
    pub ready: bool,
    /// The transfer completed with an error.
    pub error: Option<DriverError>,
}

/// An enqueue the driver refused. The region comes back to the caller.
#[derive(Debug)]
pub struct EnqueueRejected {
    /// Why the driver refused.
    pub error: DriverError,
    /// The region, unchanged.
    pub region: Region,
}

/// Temperatures as the device reports them, in tenths of a degree Celsius.
///
/// `i16::MIN` marks a sensor that is not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTemperatures {
    /// Image sensor.
    pub sensor: i16,
    /// Camera electronics.
    pub camera: i16,
    /// Power supply.
    pub power_supply: i16,
}

impl RawTemperatures {
    /// Sentinel for "not available".
    pub const UNAVAILABLE: i16 = i16::MIN;
}

impl Default for RawTemperatures {
    fn default() -> Self {
        Self {
            sensor: Self::UNAVAILABLE,
            camera: Self::UNAVAILABLE,
            power_supply: Self::UNAVAILABLE,
        }
    }
}

/// Raw health registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawHealth {
    /// Error flags.
    pub errors: u32,
    /// Warning flags.
    pub warnings: u32,
    /// Status flags.
    pub status: u32,
    /// Temperature readings.
    pub temperatures: RawTemperatures,
}

/// Fills buffer regions asynchronously.
///
/// A region is handed to the driver on `enqueue` and only comes back through
/// `take_region` once the transfer reported ready, through `free`, or inside
/// an [`EnqueueRejected`].
#[async_trait]
pub trait TransferDriver: Send + Sync {
    /// Allocate a zeroed region of `size` bytes bound to a new handle.
    async fn allocate_region(&self, size: usize) -> Result<(DriverHandle, Region), DriverError>;

    /// Queue a transfer into `region`.
    ///
    /// `start_index`/`end_index` select a 1-based range of hardware-resident
    /// images; `(0, 0)` requests live images.
    async fn enqueue(
        &self,
        handle: DriverHandle,
        region: Region,
        start_index: u32,
        end_index: u32,
        descriptor: ImageDescriptor,
    ) -> Result<(), EnqueueRejected>;

    /// Non-blocking status of one transfer.
    async fn poll_status(&self, handle: DriverHandle) -> Result<TransferStatus, DriverError>;

    /// Wait up to `timeout` for any of `handles` to complete.
    ///
    /// Returns the ready handles in completion order. Expiry is reported as a
    /// timeout error.
    async fn wait_any(
        &self,
        handles: &[DriverHandle],
        timeout: Duration,
    ) -> Result<Vec<DriverHandle>, DriverError>;

    /// Hand a completed region back to the caller.
    async fn take_region(&self, handle: DriverHandle) -> Result<Region, DriverError>;

    /// Release the handle. Returns the region if the driver still held it.
    async fn free(&self, handle: DriverHandle) -> Result<Option<Region>, DriverError>;
}

/// Reports the device health registers.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Read the error, warning and status registers plus temperatures.
    async fn read_health(&self) -> Result<RawHealth, DriverError>;
}

/// Control surface the acquisition session drives.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Write settings to the camera.
    async fn apply_settings(&self, settings: &CameraSettings) -> Result<(), DriverError>;
    /// Read back what the camera actually uses.
    async fn read_settings(&self) -> Result<CameraSettings, DriverError>;
    /// Start or stop image recording.
    async fn set_recording(&self, on: bool) -> Result<(), DriverError>;
    /// Whether the camera is still producing images.
    async fn is_recording(&self) -> Result<bool, DriverError>;
    /// Images held in the camera's recorder segment.
    async fn recorded_image_count(&self) -> Result<u64, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_conditions() {
        assert_eq!(
            DriverCondition::from_code(codes::TIMEOUT),
            DriverCondition::Timeout
        );
        assert_eq!(
            DriverCondition::from_code(codes::HARDWARE_FAULT),
            DriverCondition::HardwareFault
        );
        assert_eq!(DriverCondition::from_code(42), DriverCondition::Unknown);
    }

    #[test]
    fn benign_free_codes() {
        assert!(DriverError::new(codes::BUFFER_UNAVAILABLE).is_benign_on_free());
        assert!(DriverError::new(codes::BUFFER_CANCELLED).is_benign_on_free());
        assert!(!DriverError::new(codes::INVALID_HANDLE).is_benign_on_free());
        assert!(!DriverError::timeout().is_benign_on_free());
    }

    #[test]
    fn display_includes_condition_and_code() {
        let err = DriverError::new(codes::TRANSFER_FAILED);
        assert_eq!(
            err.to_string(),
            "Driver transfer failed error (code 0x80002005)"
        );
        assert_eq!(
            DriverError::new(7).to_string(),
            "Driver unknown error (code 0x00000007)"
        );
    }
}
