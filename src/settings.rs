//! Camera settings model and the host-side settings cache.
//!
//! `CameraSettings` is what the host wants the camera to use. It is pushed to
//! the device on `arm()` and read back to produce the [`ImageDescriptor`] that
//! sizes every buffer region.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::driver::CameraDevice;
use crate::error::{AcqError, AcqResult};
use crate::frame::TRAILER_LEN;

/// Region of interest in sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge (0-based).
    pub x: u32,
    /// Top edge (0-based).
    pub y: u32,
    /// Width in sensor pixels.
    pub width: u32,
    /// Height in sensor pixels.
    pub height: u32,
}

impl Roi {
    /// Full-frame ROI for a sensor of the given size.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Whether the ROI fits within a sensor of the given size.
    pub fn fits(&self, sensor_width: u32, sensor_height: u32) -> bool {
        self.x.saturating_add(self.width) <= sensor_width
            && self.y.saturating_add(self.height) <= sensor_height
    }
}

/// On-chip binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    /// Horizontal binning factor.
    pub horizontal: u32,
    /// Vertical binning factor.
    pub vertical: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self {
            horizontal: 1,
            vertical: 1,
        }
    }
}

/// Where the camera keeps images before they are transferred.
///
/// The mode decides how a draining session completes:
///
/// | Mode | Final readout | Recording stopped at natural end |
/// |---|---|---|
/// | `Fifo` | no | yes |
/// | `RecorderSequence` | yes | yes |
/// | `RecorderRing` | no | no |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Images stream through the camera FIFO and are transferred live.
    #[default]
    Fifo,
    /// Camera RAM records a sequence; untransferred images are read at the end.
    RecorderSequence,
    /// Camera RAM records as a ring that keeps overwriting.
    RecorderRing,
}

impl StorageMode {
    /// Whether a draining session reads back hardware-resident images.
    pub fn final_readout(self) -> bool {
        matches!(self, StorageMode::RecorderSequence)
    }

    /// Whether the pipeline turns recording off when the run ends by itself.
    pub fn stops_recording_at_end(self) -> bool {
        !matches!(self, StorageMode::RecorderRing)
    }

    /// Parse the kebab-case name used in configuration and on the CLI.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "fifo" => Some(StorageMode::Fifo),
            "recorder-sequence" => Some(StorageMode::RecorderSequence),
            "recorder-ring" => Some(StorageMode::RecorderRing),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StorageMode::Fifo => "fifo",
            StorageMode::RecorderSequence => "recorder-sequence",
            StorageMode::RecorderRing => "recorder-ring",
        };
        write!(f, "{}", label)
    }
}

/// Geometry of one transferred image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Image width in pixels after binning.
    pub width: u32,
    /// Image height in pixels after binning.
    pub height: u32,
    /// Significant bits per pixel.
    pub bit_depth: u8,
}

impl ImageDescriptor {
    /// Bytes per pixel on the wire (8-bit images pack one byte, deeper ones two).
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bit_depth).div_ceil(8).max(1)
    }

    /// Payload bytes of one image.
    pub fn image_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }

    /// Bytes of one image slot: payload plus trailer.
    pub fn slot_bytes(&self) -> usize {
        self.image_bytes() + TRAILER_LEN
    }

    /// Bytes of a region holding `images` slots.
    pub fn region_bytes(&self, images: usize) -> usize {
        self.slot_bytes() * images
    }
}

/// Acquisition settings pushed to the camera on arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Region of interest in sensor pixels.
    pub roi: Roi,
    /// Binning factors.
    pub binning: Binning,
    /// Significant bits per pixel (1..=16).
    pub bit_depth: u8,
    /// Exposure time.
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Camera-side image storage.
    pub storage_mode: StorageMode,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            roi: Roi::full(640, 480),
            binning: Binning::default(),
            bit_depth: 16,
            exposure: Duration::from_millis(10),
            storage_mode: StorageMode::Fifo,
        }
    }
}

impl CameraSettings {
    /// Check the settings for internal consistency.
    pub fn validate(&self) -> AcqResult<()> {
        if self.roi.width == 0 || self.roi.height == 0 {
            return Err(AcqError::Configuration(format!(
                "ROI must be non-empty, got {}x{}",
                self.roi.width, self.roi.height
            )));
        }
        if self.binning.horizontal == 0 || self.binning.vertical == 0 {
            return Err(AcqError::Configuration(
                "Binning factors must be at least 1".to_string(),
            ));
        }
        if self.roi.width % self.binning.horizontal != 0
            || self.roi.height % self.binning.vertical != 0
        {
            return Err(AcqError::Configuration(format!(
                "ROI {}x{} is not divisible by binning {}x{}",
                self.roi.width, self.roi.height, self.binning.horizontal, self.binning.vertical
            )));
        }
        if !(1..=16).contains(&self.bit_depth) {
            return Err(AcqError::Configuration(format!(
                "Invalid bit_depth {}. Must be 1-16",
                self.bit_depth
            )));
        }
        if self.exposure.is_zero() {
            return Err(AcqError::Configuration(
                "Exposure must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Image geometry these settings produce.
    pub fn image_descriptor(&self) -> ImageDescriptor {
        ImageDescriptor {
            width: self.roi.width / self.binning.horizontal.max(1),
            height: self.roi.height / self.binning.vertical.max(1),
            bit_depth: self.bit_depth,
        }
    }

    /// Names of the fields that differ between two settings.
    pub fn diff(&self, other: &CameraSettings) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.roi != other.roi {
            fields.push("roi");
        }
        if self.binning != other.binning {
            fields.push("binning");
        }
        if self.bit_depth != other.bit_depth {
            fields.push("bit_depth");
        }
        if self.exposure != other.exposure {
            fields.push("exposure");
        }
        if self.storage_mode != other.storage_mode {
            fields.push("storage_mode");
        }
        fields
    }
}

/// Result of comparing the host cache with the device.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// True when the device holds exactly the requested settings.
    pub in_sync: bool,
    /// Fields that differ.
    pub mismatched: Vec<&'static str>,
    /// Settings as read back from the device.
    pub settings: CameraSettings,
}

/// Requested settings plus the last values confirmed by the device.
#[derive(Debug, Clone, Default)]
pub struct SettingsCache {
    requested: CameraSettings,
    confirmed: Option<CameraSettings>,
}

impl SettingsCache {
    /// Cache with `requested` as the pending settings.
    pub fn new(requested: CameraSettings) -> Self {
        Self {
            requested,
            confirmed: None,
        }
    }

    /// Settings the host wants.
    pub fn requested(&self) -> &CameraSettings {
        &self.requested
    }

    /// Settings last read back from the device, if any.
    pub fn confirmed(&self) -> Option<&CameraSettings> {
        self.confirmed.as_ref()
    }

    /// Replace the requested settings. Confirmation is dropped.
    pub fn set(&mut self, settings: CameraSettings) {
        self.requested = settings;
        self.confirmed = None;
    }

    /// Push the requested settings to the device and read them back.
    pub async fn apply(&mut self, device: &dyn CameraDevice) -> AcqResult<SyncReport> {
        self.requested.validate()?;
        device.apply_settings(&self.requested).await?;
        self.sync(device).await
    }

    /// Read the device settings and compare them with the requested ones.
    ///
    /// Mismatches are logged and reported; the device values become the
    /// confirmed settings either way.
    pub async fn sync(&mut self, device: &dyn CameraDevice) -> AcqResult<SyncReport> {
        let actual = device.read_settings().await?;
        let mismatched = self.requested.diff(&actual);
        if mismatched.is_empty() {
            debug!("Camera settings in sync");
        } else {
            warn!(
                fields = ?mismatched,
                "Camera settings differ from requested values"
            );
        }
        self.confirmed = Some(actual.clone());
        Ok(SyncReport {
            in_sync: mismatched.is_empty(),
            mismatched,
            settings: actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_accounts_for_binning_and_depth() {
        let settings = CameraSettings {
            roi: Roi::full(640, 480),
            binning: Binning {
                horizontal: 2,
                vertical: 4,
            },
            bit_depth: 12,
            ..Default::default()
        };
        let desc = settings.image_descriptor();
        assert_eq!((desc.width, desc.height), (320, 120));
        assert_eq!(desc.image_bytes(), 320 * 120 * 2);
        assert_eq!(desc.slot_bytes(), 320 * 120 * 2 + 16);
        assert_eq!(desc.region_bytes(3), 3 * desc.slot_bytes());
    }

    #[test]
    fn eight_bit_images_use_one_byte() {
        let desc = ImageDescriptor {
            width: 10,
            height: 10,
            bit_depth: 8,
        };
        assert_eq!(desc.image_bytes(), 100);
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut settings = CameraSettings::default();
        assert!(settings.validate().is_ok());

        settings.binning.horizontal = 3;
        assert!(matches!(
            settings.validate(),
            Err(AcqError::Configuration(_))
        ));

        settings.binning.horizontal = 1;
        settings.bit_depth = 17;
        assert!(settings.validate().is_err());

        settings.bit_depth = 16;
        settings.exposure = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn storage_mode_policy_table() {
        assert!(!StorageMode::Fifo.final_readout());
        assert!(StorageMode::Fifo.stops_recording_at_end());
        assert!(StorageMode::RecorderSequence.final_readout());
        assert!(StorageMode::RecorderSequence.stops_recording_at_end());
        assert!(!StorageMode::RecorderRing.final_readout());
        assert!(!StorageMode::RecorderRing.stops_recording_at_end());
    }

    #[test]
    fn storage_mode_names_round_trip_through_display() {
        for mode in [
            StorageMode::Fifo,
            StorageMode::RecorderSequence,
            StorageMode::RecorderRing,
        ] {
            assert_eq!(StorageMode::parse(&mode.to_string()), Some(mode));
        }
        assert_eq!(StorageMode::parse("ring"), None);
    }

    #[test]
    fn diff_names_changed_fields() {
        let a = CameraSettings::default();
        let mut b = a.clone();
        b.bit_depth = 12;
        b.storage_mode = StorageMode::RecorderRing;
        assert_eq!(a.diff(&b), vec!["bit_depth", "storage_mode"]);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn roi_fit_check() {
        let roi = Roi {
            x: 100,
            y: 0,
            width: 540,
            height: 480,
        };
        assert!(roi.fits(640, 480));
        assert!(!roi.fits(639, 480));
    }
}
