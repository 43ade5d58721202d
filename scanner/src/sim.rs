/*!
Simulated hardware worker.

Speaks the full worker protocol over any async byte stream so the
orchestrator can run without a camera or DAQ attached. Frames are synthetic
grayscale PGM images; the turntable position is tracked in software.

Failures can be injected per call index (counted over the worker's
lifetime, zero-based) to exercise the orchestrator's error paths.
*/

use crate::codec::Codec;
use serde_json::{json, Value};
use shared::frame::encode_data_uri;
use shared::protocol::{
    Command, ConnectParams, Device, FrameReadyPayload, ProgressPayload, Request, Response,
    WorkerEvent, DeviceErrorPayload,
};
use shared::{CameraSettings, StageSettings};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

/// Behaviour knobs for the simulated worker
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub fail_camera_connect: bool,
    pub fail_stage_connect: bool,
    /// Fail the n-th `rotate` command
    pub fail_rotate_on: Option<u32>,
    /// Fail the n-th `capture` command
    pub fail_capture_on: Option<u32>,
    /// Drop the connection when the n-th `capture` arrives
    pub close_on_capture: Option<u32>,
    /// Reject `disconnect` for this device
    pub fail_disconnect: Option<Device>,
    /// Interleave unsolicited progress/frame_ready events with responses
    pub emit_events: bool,
    /// Delay before answering each command
    pub response_delay: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            fail_camera_connect: false,
            fail_stage_connect: false,
            fail_rotate_on: None,
            fail_capture_on: None,
            close_on_capture: None,
            fail_disconnect: None,
            emit_events: true,
            response_delay: None,
        }
    }
}

enum Outcome {
    Reply(Response),
    Hangup,
}

/// In-process stand-in for the hardware worker process
pub struct SimulatedWorker {
    config: SimConfig,
    camera: Option<CameraSettings>,
    stage: Option<StageSettings>,
    position: f64,
    rotate_calls: u32,
    capture_calls: u32,
    pending_events: Vec<WorkerEvent>,
}

impl SimulatedWorker {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            camera: None,
            stage: None,
            position: 0.0,
            rotate_calls: 0,
            capture_calls: 0,
            pending_events: Vec::new(),
        }
    }

    /// Run the worker on an in-memory stream and return a codec connected to it
    pub fn spawn(self) -> Codec {
        let (host, worker) = tokio::io::duplex(1024 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        tokio::spawn(async move {
            if let Err(e) = self.serve(worker_read, worker_write).await {
                debug!("Simulated worker stopped: {}", e);
            }
        });
        let (host_read, host_write) = tokio::io::split(host);
        Codec::new(host_read, host_write)
    }

    /// Serve commands until the input closes or a hangup is injected
    pub async fn serve<R, W>(mut self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Simulated worker ready");
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let request: Request = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    self.event(WorkerEvent::DeviceError(DeviceErrorPayload {
                        device: None,
                        message: format!("invalid command: {}", e),
                    }));
                    self.flush_events(&mut writer).await?;
                    continue;
                }
            };

            if let Some(delay) = self.config.response_delay {
                tokio::time::sleep(delay).await;
            }

            let outcome = self.handle(request);
            self.flush_events(&mut writer).await?;
            match outcome {
                Outcome::Reply(response) => {
                    write_line(&mut writer, &serde_json::to_string(&response)?).await?;
                }
                Outcome::Hangup => {
                    info!("Simulated worker hanging up");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn event(&mut self, event: WorkerEvent) {
        if self.config.emit_events {
            self.pending_events.push(event);
        }
    }

    async fn flush_events<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        for event in std::mem::take(&mut self.pending_events) {
            write_line(writer, &serde_json::to_string(&event)?).await?;
        }
        Ok(())
    }

    fn handle(&mut self, request: Request) -> Outcome {
        let id = request.id;
        let result = match request.command {
            Command::Capture => {
                let index = self.capture_calls;
                self.capture_calls += 1;
                if self.config.close_on_capture == Some(index) {
                    return Outcome::Hangup;
                }
                self.capture(index)
            }
            command => self.execute(command),
        };

        Outcome::Reply(match result {
            Ok(data) => Response::ok(id, data),
            Err(message) => Response::err(id, message),
        })
    }

    fn execute(&mut self, command: Command) -> Result<Value, String> {
        match command {
            Command::Connect(ConnectParams::Camera(settings)) => {
                if self.config.fail_camera_connect {
                    return Err(format!("no camera found at {}", settings.camera_ip_address));
                }
                self.camera = Some(settings);
                self.progress("Mock camera opened");
                Ok(json!({ "connected": true }))
            }
            Command::Connect(ConnectParams::Stage(settings)) => {
                if self.config.fail_stage_connect {
                    return Err(format!("DAQ device {} not found", settings.device_name));
                }
                self.stage = Some(settings);
                self.position = 0.0;
                self.progress("Mock DAQ initialized");
                Ok(json!({ "connected": true }))
            }
            Command::Disconnect(params) => {
                if self.config.fail_disconnect == Some(params.device) {
                    return Err(format!("{} refused to release", params.device));
                }
                match params.device {
                    Device::Camera => self.camera = None,
                    Device::Stage => self.stage = None,
                }
                Ok(json!({ "connected": false }))
            }
            Command::Configure(update) => {
                let camera = self
                    .camera
                    .as_mut()
                    .ok_or("Camera not connected. Call connect() first.")?;
                update.apply_to(camera);
                Ok(json!({ "configured": true }))
            }
            Command::Rotate(params) => {
                self.require_stage()?;
                let index = self.rotate_calls;
                self.rotate_calls += 1;
                if self.config.fail_rotate_on == Some(index) {
                    return Err("stepper motor stalled".to_string());
                }
                self.move_by(params.degrees);
                Ok(json!({ "position": self.position }))
            }
            Command::Step(params) => {
                let steps_per_revolution = self.require_stage()?.steps_per_revolution;
                let degrees =
                    params.count as f64 / steps_per_revolution as f64 * 360.0 * params.direction.sign();
                self.move_by(degrees);
                Ok(json!({ "position": self.position }))
            }
            Command::Home => {
                self.require_stage()?;
                self.position = 0.0;
                self.progress("Mock DAQ homing complete");
                Ok(json!({ "position": self.position }))
            }
            Command::GetStatus(params) => Ok(match params.device {
                Device::Camera => json!({
                    "connected": self.camera.is_some(),
                    "mock": true,
                    "available": true,
                }),
                Device::Stage => json!({
                    "initialized": self.stage.is_some(),
                    "position": self.position,
                    "mock": true,
                    "available": true,
                }),
            }),
            Command::Capture => Err("capture is handled separately".to_string()),
        }
    }

    fn capture(&mut self, index: u32) -> Result<Value, String> {
        let camera = self.camera.as_ref().ok_or("Camera is not open")?;
        if self.config.fail_capture_on == Some(index) {
            return Err("frame grab timed out".to_string());
        }

        let width = camera.width.unwrap_or(DEFAULT_WIDTH);
        let height = camera.height.unwrap_or(DEFAULT_HEIGHT);
        let image = synthetic_pgm(width, height, index);
        self.event(WorkerEvent::FrameReady(FrameReadyPayload {
            frame_number: index,
            path: None,
        }));

        Ok(json!({
            "image": encode_data_uri("image/x-portable-graymap", &image),
            "width": width,
            "height": height,
        }))
    }

    fn require_stage(&self) -> Result<&StageSettings, String> {
        self.stage
            .as_ref()
            .ok_or_else(|| "DAQ not initialized. Call initialize() first.".to_string())
    }

    fn move_by(&mut self, degrees: f64) {
        let mut position = (self.position + degrees).rem_euclid(360.0);
        if position >= 360.0 {
            position = 0.0;
        }
        self.position = position;
        self.progress(&format!("Mock DAQ rotation complete. Position: {:.2}°", position));
    }

    fn progress(&mut self, message: &str) {
        self.event(WorkerEvent::Progress(ProgressPayload {
            message: message.to_string(),
        }));
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Binary PGM with a vertical gradient offset per frame
fn synthetic_pgm(width: u32, height: u32, frame: u32) -> Vec<u8> {
    let header = format!("P5\n{} {}\n255\n", width, height);
    let pixels = (width as usize).saturating_mul(height as usize);
    let mut image = Vec::with_capacity(header.len().saturating_add(pixels));
    image.extend_from_slice(header.as_bytes());

    let rows = u64::from(height.max(1));
    let offset = u64::from(frame) * 7;
    for y in 0..u64::from(height) {
        let shade = (y * 255 / rows + offset) % 256;
        image.extend(std::iter::repeat(shade as u8).take(width as usize));
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_pgm_layout() {
        let image = synthetic_pgm(4, 2, 0);
        let header = b"P5\n4 2\n255\n";
        assert!(image.starts_with(header));
        assert_eq!(image.len(), header.len() + 8);
    }

    #[test]
    fn test_synthetic_pgm_tall_image_and_late_frame() {
        // Rows past 2^32 / 255 and frame numbers near u32::MAX
        let height = 17_000_000;
        let image = synthetic_pgm(1, height, u32::MAX);

        let header = format!("P5\n1 {}\n255\n", height);
        assert_eq!(image.len(), header.len() + height as usize);
        let offset = u64::from(u32::MAX) * 7;
        let last_row = u64::from(height - 1) * 255 / u64::from(height);
        assert_eq!(image[image.len() - 1] as u64, (last_row + offset) % 256);
    }

    #[tokio::test]
    async fn test_invalid_command_reports_device_error_event() {
        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        tokio::spawn(SimulatedWorker::new(SimConfig::default()).serve(worker_read, worker_write));

        let (host_read, mut host_write) = tokio::io::split(host);
        host_write.write_all(b"{\"id\":1,\"command\":\"explode\"}\n").await.unwrap();

        let mut lines = BufReader::new(host_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "device_error");
    }
}
