/*!
Camera proxy.

Typed wrapper over the codec for camera commands. Every method is exactly one
request/response round trip; retry decisions belong to the caller.
*/

use crate::codec::Codec;
use shared::frame::CapturedFrame;
use shared::protocol::{
    CameraStatus, CaptureReply, Command, ConfigureReply, ConnectParams, ConnectReply, Device,
    DeviceParams,
};
use shared::{CameraConfig, CameraSettings, Result};
use tracing::debug;

#[derive(Clone)]
pub struct CameraProxy {
    codec: Codec,
}

impl CameraProxy {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    /// Open the camera with the given settings
    pub async fn connect(&self, settings: &CameraSettings) -> Result<bool> {
        debug!("Connecting camera {}", settings.camera_ip_address);
        let reply: ConnectReply = self
            .codec
            .call_as(Command::Connect(ConnectParams::Camera(settings.clone())))
            .await?;
        Ok(reply.connected)
    }

    /// Close the camera; `true` once the worker has released it
    pub async fn disconnect(&self) -> Result<bool> {
        self.codec
            .call(Command::Disconnect(DeviceParams { device: Device::Camera }))
            .await?;
        Ok(true)
    }

    /// Apply a partial settings update to the open camera
    pub async fn configure(&self, update: &CameraConfig) -> Result<bool> {
        let reply: ConfigureReply = self.codec.call_as(Command::Configure(update.clone())).await?;
        Ok(reply.configured)
    }

    /// Grab one frame
    pub async fn capture(&self) -> Result<CapturedFrame> {
        let reply: CaptureReply = self.codec.call_as(Command::Capture).await?;
        CapturedFrame::from_reply(&reply)
    }

    pub async fn get_status(&self) -> Result<CameraStatus> {
        self.codec
            .call_as(Command::GetStatus(DeviceParams { device: Device::Camera }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedWorker};

    #[tokio::test]
    async fn test_connect_capture_disconnect() {
        let codec = SimulatedWorker::new(SimConfig::default()).spawn();
        let camera = CameraProxy::new(codec);

        assert!(camera.connect(&CameraSettings::default()).await.unwrap());
        assert!(camera.get_status().await.unwrap().connected);

        let frame = camera.capture().await.unwrap();
        assert_eq!(frame.extension(), "pgm");
        assert!(!frame.bytes.is_empty());

        assert!(camera.disconnect().await.unwrap());
        assert!(!camera.get_status().await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_capture_without_connect_fails() {
        let codec = SimulatedWorker::new(SimConfig::default()).spawn();
        let camera = CameraProxy::new(codec);

        let err = camera.capture().await.unwrap_err();
        assert!(err.to_string().contains("not open"));
    }

    #[tokio::test]
    async fn test_configure_updates_open_camera() {
        let codec = SimulatedWorker::new(SimConfig::default()).spawn();
        let camera = CameraProxy::new(codec);
        camera.connect(&CameraSettings::default()).await.unwrap();

        let update = CameraConfig {
            width: Some(32),
            height: Some(24),
            ..Default::default()
        };
        assert!(camera.configure(&update).await.unwrap());

        let frame = camera.capture().await.unwrap();
        assert_eq!((frame.width, frame.height), (32, 24));
    }
}
