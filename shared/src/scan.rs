/*!
Scan lifecycle, progress and result types.

These are the values the orchestrator hands to its listeners and callers.
They are transient: constructed per event or per call and not retained.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Uninitialized,
    Initializing,
    Ready,
    Scanning,
    Finalizing,
    Error,
}

impl ScannerState {
    /// States from which `initialize` may start
    pub fn can_initialize(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Ready | Self::Error)
    }

    /// True while a scan holds the devices
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Initializing | Self::Scanning | Self::Finalizing)
    }
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Scanning => "Scanning",
            Self::Finalizing => "Finalizing",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Emitted once per captured frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Zero-indexed frame number
    pub frame_number: u32,
    pub total_frames: u32,
    /// Commanded stage position in degrees, within [0, 360)
    pub position: f64,
    /// Written frame file, absent until flushed to disk
    pub image_path: Option<PathBuf>,
}

/// Terminal outcome of one `scan()` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub success: bool,
    pub frames_captured: u32,
    pub output_path: PathBuf,
    /// Present once the scan record exists in the repository
    pub scan_id: Option<String>,
    /// Set only when `success` is false
    pub error: Option<String>,
    /// Non-fatal issues, e.g. a failed database write
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ScanResult {
    /// Successful capture of every requested frame
    pub fn succeeded(frames_captured: u32, output_path: PathBuf) -> Self {
        Self {
            success: true,
            frames_captured,
            output_path,
            scan_id: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// Failed or rejected scan with the frames captured before the failure
    pub fn failed(frames_captured: u32, output_path: PathBuf, error: impl Into<String>) -> Self {
        Self {
            success: false,
            frames_captured,
            output_path,
            scan_id: None,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }
}

/// Operation during which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialize,
    Scan,
}

/// Payload delivered to error listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub phase: Phase,
    pub message: String,
    pub frames_captured: u32,
}

/// Reply shape of `initialize` and `cleanup`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleReply {
    pub success: bool,
    pub initialized: bool,
}

/// Snapshot returned by the orchestrator's `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub success: bool,
    pub initialized: bool,
    pub state: ScannerState,
    pub camera_status: String,
    pub daq_status: String,
    pub position: f64,
    pub mock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_allowed() {
        assert!(ScannerState::Uninitialized.can_initialize());
        assert!(ScannerState::Ready.can_initialize());
        assert!(ScannerState::Error.can_initialize());
        assert!(!ScannerState::Scanning.can_initialize());
        assert!(!ScannerState::Initializing.can_initialize());
        assert!(ScannerState::Finalizing.is_busy());
    }

    #[test]
    fn test_result_constructors() {
        let ok = ScanResult::succeeded(72, PathBuf::from("scans/a"));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = ScanResult::failed(3, PathBuf::from("scans/a"), "rotate failed");
        assert!(!failed.success);
        assert_eq!(failed.frames_captured, 3);
        assert_eq!(failed.error.as_deref(), Some("rotate failed"));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ScannerState::Uninitialized).unwrap();
        assert_eq!(json, "\"uninitialized\"");
    }
}
