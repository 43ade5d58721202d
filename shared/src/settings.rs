/*!
Scan configuration types.

[`ScannerSettings`] is handed to the orchestrator's `initialize` and bundles
the camera and stage settings forwarded to the worker with the scan-level
options (frame count, output directory, optional metadata).
*/

use crate::error::{Result, ScannerError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of frames per full rotation
pub const DEFAULT_FRAME_COUNT: u32 = 72;

/// Default root directory for captured scans
pub const DEFAULT_OUTPUT_DIR: &str = "./scans";

/// Camera configuration forwarded to the worker on connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Camera IP address or device identifier
    pub camera_ip_address: String,

    /// Exposure time in microseconds
    pub exposure_time: f64,

    /// Raw gain value
    pub gain: f64,

    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// Time for one complete rotation, used by hardware-triggered captures
    #[serde(default = "default_camera_seconds_per_rot")]
    pub seconds_per_rot: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

fn default_gamma() -> f64 {
    1.0
}

fn default_camera_seconds_per_rot() -> f64 {
    36.0
}

impl CameraSettings {
    pub fn validate(&self) -> Result<()> {
        if self.camera_ip_address.trim().is_empty() {
            return Err(ScannerError::invalid_settings("camera_ip_address cannot be empty"));
        }
        if !(self.exposure_time > 0.0) {
            return Err(ScannerError::invalid_settings(format!(
                "exposure_time must be positive, got {}",
                self.exposure_time
            )));
        }
        if self.gain < 0.0 {
            return Err(ScannerError::invalid_settings(format!(
                "gain must be non-negative, got {}",
                self.gain
            )));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(ScannerError::invalid_settings("width and height must be positive"));
        }
        Ok(())
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            camera_ip_address: "10.0.0.23".to_string(),
            exposure_time: 10_000.0,
            gain: 0.0,
            gamma: default_gamma(),
            seconds_per_rot: default_camera_seconds_per_rot(),
            brightness: None,
            contrast: None,
            width: None,
            height: None,
        }
    }
}

/// Partial camera settings for `configure`; only present fields are applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl CameraConfig {
    /// Apply the present fields onto full camera settings
    pub fn apply_to(&self, settings: &mut CameraSettings) {
        if let Some(v) = self.exposure_time {
            settings.exposure_time = v;
        }
        if let Some(v) = self.gain {
            settings.gain = v;
        }
        if let Some(v) = self.gamma {
            settings.gamma = v;
        }
        if self.brightness.is_some() {
            settings.brightness = self.brightness;
        }
        if self.contrast.is_some() {
            settings.contrast = self.contrast;
        }
        if self.width.is_some() {
            settings.width = self.width;
        }
        if self.height.is_some() {
            settings.height = self.height;
        }
    }
}

/// Turntable (stepper motor via DAQ) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// DAQ device name, e.g. "cDAQ1Mod1"
    pub device_name: String,

    /// Steps for a full 360° rotation
    pub steps_per_revolution: u32,

    /// Wait after each rotation before capturing, in milliseconds (0 = none)
    pub step_delay_ms: u64,

    /// DAQ sampling rate in Hz
    pub sampling_rate: u32,

    /// Digital output line for the step signal
    pub step_pin: u8,

    /// Digital output line for the direction signal
    pub dir_pin: u8,

    /// Time for one complete rotation in seconds
    pub seconds_per_rot: f64,
}

impl StageSettings {
    pub fn validate(&self) -> Result<()> {
        if self.device_name.trim().is_empty() {
            return Err(ScannerError::invalid_settings("device_name cannot be empty"));
        }
        if self.steps_per_revolution == 0 {
            return Err(ScannerError::invalid_settings("steps_per_revolution must be positive"));
        }
        if self.sampling_rate == 0 {
            return Err(ScannerError::invalid_settings("sampling_rate must be positive"));
        }
        if !(self.seconds_per_rot > 0.0) {
            return Err(ScannerError::invalid_settings(format!(
                "seconds_per_rot must be positive, got {}",
                self.seconds_per_rot
            )));
        }
        if self.step_pin == self.dir_pin {
            return Err(ScannerError::invalid_settings(format!(
                "step_pin and dir_pin must be different, both are {}",
                self.step_pin
            )));
        }
        Ok(())
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            device_name: "cDAQ1Mod1".to_string(),
            steps_per_revolution: 6400,
            step_delay_ms: 0,
            sampling_rate: 40_000,
            step_pin: 0,
            dir_pin: 1,
            seconds_per_rot: 7.0,
        }
    }
}

/// Identifies who and what a scan belongs to; required for persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub experiment_id: String,
    pub phenotyper_id: String,
    /// Scanner station name
    pub scanner_name: String,
    pub plant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accession_name: Option<String>,
    pub plant_age_days: u32,
    /// Repeated-measurement round for the same plant
    pub wave_number: u32,
}

impl ScanMetadata {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("experiment_id", &self.experiment_id),
            ("phenotyper_id", &self.phenotyper_id),
            ("scanner_name", &self.scanner_name),
            ("plant_id", &self.plant_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ScannerError::invalid_settings(format!("{} cannot be empty", name)));
            }
        }
        Ok(())
    }
}

/// Complete configuration for one initialize/scan/cleanup cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerSettings {
    pub camera: CameraSettings,

    #[serde(default)]
    pub stage: StageSettings,

    /// Frames per full rotation
    #[serde(default = "default_frame_count")]
    pub frame_count: u32,

    /// Root directory; each scan gets its own timestamped subdirectory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Without metadata the scan runs in preview mode and is not recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ScanMetadata>,
}

fn default_frame_count() -> u32 {
    DEFAULT_FRAME_COUNT
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

impl ScannerSettings {
    /// Create settings with the default frame count and output directory
    pub fn new(camera: CameraSettings, stage: StageSettings) -> Self {
        Self {
            camera,
            stage,
            frame_count: DEFAULT_FRAME_COUNT,
            output_dir: default_output_dir(),
            metadata: None,
        }
    }

    pub fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_metadata(mut self, metadata: ScanMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validate all nested settings
    pub fn validate(&self) -> Result<()> {
        if self.frame_count == 0 {
            return Err(ScannerError::invalid_settings("frame_count must be positive"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ScannerError::invalid_settings("output_dir cannot be empty"));
        }
        self.camera.validate()?;
        self.stage.validate()?;
        if let Some(metadata) = &self.metadata {
            metadata.validate()?;
        }
        Ok(())
    }

    /// Angular spacing between consecutive frames
    pub fn degrees_per_frame(&self) -> f64 {
        360.0 / self.frame_count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ScanMetadata {
        ScanMetadata {
            experiment_id: "exp-7".to_string(),
            phenotyper_id: "ph-2".to_string(),
            scanner_name: "station-a".to_string(),
            plant_id: "plant-0042".to_string(),
            accession_name: None,
            plant_age_days: 14,
            wave_number: 0,
        }
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = serde_json::json!({
            "camera": {
                "camera_ip_address": "10.0.0.23",
                "exposure_time": 10000.0,
                "gain": 0.0
            }
        });
        let settings: ScannerSettings = serde_json::from_value(json).unwrap();

        assert_eq!(settings.frame_count, 72);
        assert_eq!(settings.output_dir, PathBuf::from("./scans"));
        assert_eq!(settings.camera.gamma, 1.0);
        assert_eq!(settings.stage.steps_per_revolution, 6400);
        assert!(settings.metadata.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let base = ScannerSettings::new(CameraSettings::default(), StageSettings::default());

        assert!(base.clone().with_frame_count(0).validate().is_err());
        assert!(base.clone().with_output_dir("").validate().is_err());

        let mut bad_camera = base.clone();
        bad_camera.camera.exposure_time = 0.0;
        assert!(bad_camera.validate().is_err());

        let mut bad_stage = base.clone();
        bad_stage.stage.dir_pin = bad_stage.stage.step_pin;
        assert!(bad_stage.validate().is_err());

        let mut bad_metadata = metadata();
        bad_metadata.plant_id = "  ".to_string();
        assert!(base.with_metadata(bad_metadata).validate().is_err());
    }

    #[test]
    fn test_camera_config_applies_only_present_fields() {
        let mut camera = CameraSettings::default();
        let update = CameraConfig {
            gain: Some(4.5),
            width: Some(640),
            ..Default::default()
        };
        update.apply_to(&mut camera);

        assert_eq!(camera.gain, 4.5);
        assert_eq!(camera.width, Some(640));
        assert_eq!(camera.exposure_time, 10_000.0);
        assert_eq!(camera.height, None);
    }

    #[test]
    fn test_degrees_per_frame() {
        let settings = ScannerSettings::new(CameraSettings::default(), StageSettings::default())
            .with_frame_count(4);
        assert_eq!(settings.degrees_per_frame(), 90.0);
    }
}
