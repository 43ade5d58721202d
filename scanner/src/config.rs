/*!
Configuration management for the scanner application.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::limits::DEFAULT_REQUEST_TIMEOUT_MS;
use shared::settings::{DEFAULT_FRAME_COUNT, DEFAULT_OUTPUT_DIR};
use shared::{CameraSettings, ScanMetadata, ScannerSettings, StageSettings};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub camera: CameraSettings,

    #[serde(default)]
    pub stage: StageSettings,

    /// Present for recorded scans; omit for preview runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ScanMetadata>,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            worker: WorkerConfig::default(),
            scan: ScanConfig::default(),
            camera: CameraSettings::default(),
            stage: StageSettings::default(),
            metadata: None,
            persistence: PersistenceConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Settings for one initialize/scan cycle
    pub fn scanner_settings(&self) -> ScannerSettings {
        let mut settings = ScannerSettings::new(self.camera.clone(), self.stage.clone())
            .with_frame_count(self.scan.frame_count)
            .with_output_dir(&self.scan.output_dir);
        if let Some(metadata) = &self.metadata {
            settings = settings.with_metadata(metadata.clone());
        }
        settings
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How to reach the hardware worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable; ignored when `simulate` is set
    pub executable: PathBuf,

    /// Extra command-line arguments for the worker
    pub args: Vec<String>,

    /// Per-command response timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Run the in-process simulated worker instead
    pub simulate: bool,
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("scanner-worker"),
            args: Vec::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            simulate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Root directory for scan output
    pub output_dir: PathBuf,

    /// Frames per full rotation
    pub frame_count: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            frame_count: DEFAULT_FRAME_COUNT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON-lines records file; scans are not recorded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_path: Option<PathBuf>,
}
