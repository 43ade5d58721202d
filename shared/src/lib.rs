/*!
# Shared Types and Utilities

This crate contains the types shared between the scanner orchestrator, the
simulated worker, and any host embedding them.

## Core Types

- [`ScannerSettings`] - Camera, stage and scan configuration
- [`ScanProgress`] / [`ScanResult`] - Per-frame and terminal scan outcomes
- [`Command`] / [`Inbound`] - Worker wire protocol messages
- [`CapturedFrame`] - Decoded camera frame

## Modules

- [`settings`] - Configuration types and validation
- [`scan`] - Lifecycle states, progress and result types
- [`protocol`] - Worker command/response/event messages
- [`frame`] - Frame payload decoding and file naming
- [`error`] - Common error types
*/

pub mod error;
pub mod frame;
pub mod protocol;
pub mod scan;
pub mod settings;

// Re-export commonly used types
pub use error::{ErrorKind, Result, ScannerError};
pub use frame::CapturedFrame;
pub use protocol::{Command, Device, Direction, Inbound, Request, Response, WorkerEvent};
pub use scan::{
    LifecycleReply, Phase, ScanFailure, ScanProgress, ScanResult, ScannerState, StatusReport,
};
pub use settings::{CameraConfig, CameraSettings, ScanMetadata, ScannerSettings, StageSettings};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod limits {
    /// Longest accepted protocol line; captured frames travel inline as base64
    pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

    /// Default time to wait for a worker response, in milliseconds
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
}
