/*!
Worker process wire protocol.

Messages are newline-delimited JSON. The host sends commands carrying a
correlation id; the worker answers each with a response echoing the id and
may interleave unsolicited events that carry no id:

```text
-> {"id":7,"command":"rotate","params":{"degrees":5.0}}
<- {"event":"progress","payload":{"message":"rotating 5.00°"}}
<- {"id":7,"success":true,"data":{"position":5.0}}
```

Inbound lines are validated into the closed [`Inbound`] union at the
boundary; anything else is rejected with a protocol error.
*/

use crate::error::{Result, ScannerError};
use crate::settings::{CameraConfig, CameraSettings, StageSettings};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Device addressed by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Camera,
    Stage,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera => f.write_str("camera"),
            Self::Stage => f.write_str("stage"),
        }
    }
}

/// Stepper rotation direction, `1` clockwise and `-1` counter-clockwise on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

impl Direction {
    /// Direction of travel for a signed rotation
    pub fn of(degrees: f64) -> Self {
        if degrees < 0.0 {
            Self::CounterClockwise
        } else {
            Self::Clockwise
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Self::Clockwise => 1.0,
            Self::CounterClockwise => -1.0,
        }
    }
}

impl From<Direction> for i8 {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Clockwise => 1,
            Direction::CounterClockwise => -1,
        }
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Clockwise),
            -1 => Ok(Self::CounterClockwise),
            other => Err(format!("direction must be 1 or -1, got {}", other)),
        }
    }
}

/// Settings sent with `connect`, tagged by device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum ConnectParams {
    Camera(CameraSettings),
    Stage(StageSettings),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    pub device: Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotateParams {
    /// Relative rotation; positive is clockwise
    pub degrees: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepParams {
    pub count: u32,
    pub direction: Direction,
}

/// Commands understood by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Command {
    Connect(ConnectParams),
    Disconnect(DeviceParams),
    Configure(CameraConfig),
    Capture,
    Rotate(RotateParams),
    Step(StepParams),
    Home,
    GetStatus(DeviceParams),
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::Configure(_) => "configure",
            Self::Capture => "capture",
            Self::Rotate(_) => "rotate",
            Self::Step(_) => "step",
            Self::Home => "home",
            Self::GetStatus(_) => "get_status",
        }
    }
}

/// Outbound command envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    /// Serialize to a single line without the trailing newline
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Reply to a command, matched by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReadyPayload {
    pub frame_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    pub message: String,
}

/// Unsolicited worker notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum WorkerEvent {
    Progress(ProgressPayload),
    FrameReady(FrameReadyPayload),
    DeviceError(DeviceErrorPayload),
}

/// Any message the worker may send
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Event(WorkerEvent),
}

impl Inbound {
    /// Parse and validate one protocol line
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ScannerError::protocol(format!("unparsable message: {}", e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| ScannerError::protocol("message is not a JSON object"))?;

        if object.contains_key("id") {
            let response = serde_json::from_value(value)
                .map_err(|e| ScannerError::protocol(format!("invalid response: {}", e)))?;
            Ok(Self::Response(response))
        } else if object.contains_key("event") {
            let event = serde_json::from_value(value)
                .map_err(|e| ScannerError::protocol(format!("invalid event: {}", e)))?;
            Ok(Self::Event(event))
        } else {
            Err(ScannerError::protocol("message has neither id nor event"))
        }
    }
}

/// `connect` reply data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub connected: bool,
}

/// `configure` reply data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureReply {
    pub configured: bool,
}

/// `capture` reply data; `image` is a base64 data URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureReply {
    pub image: String,
    pub width: u32,
    pub height: u32,
}

/// Reply data for stage motion commands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionReply {
    pub position: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub connected: bool,
    #[serde(default)]
    pub mock: bool,
    #[serde(default)]
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub initialized: bool,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub mock: bool,
    #[serde(default)]
    pub available: bool,
}
