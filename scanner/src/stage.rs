/*!
Stage (turntable) proxy.

Motion commands answer with the stage position in degrees after the move,
normalized by the worker to [0, 360).
*/

use crate::codec::Codec;
use shared::protocol::{
    Command, ConnectParams, ConnectReply, Device, DeviceParams, Direction, PositionReply,
    RotateParams, StageStatus, StepParams,
};
use shared::{Result, StageSettings};
use tracing::debug;

#[derive(Clone)]
pub struct StageProxy {
    codec: Codec,
}

impl StageProxy {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    /// Reserve the motor-control device
    pub async fn connect(&self, settings: &StageSettings) -> Result<bool> {
        debug!("Connecting stage {}", settings.device_name);
        let reply: ConnectReply = self
            .codec
            .call_as(Command::Connect(ConnectParams::Stage(settings.clone())))
            .await?;
        Ok(reply.connected)
    }

    pub async fn disconnect(&self) -> Result<bool> {
        self.codec
            .call(Command::Disconnect(DeviceParams { device: Device::Stage }))
            .await?;
        Ok(true)
    }

    /// Relative rotation; positive is clockwise
    pub async fn rotate_by(&self, degrees: f64) -> Result<f64> {
        let reply: PositionReply = self
            .codec
            .call_as(Command::Rotate(RotateParams { degrees }))
            .await?;
        Ok(reply.position)
    }

    /// Raw stepper steps in one direction
    pub async fn step_by(&self, count: u32, direction: Direction) -> Result<f64> {
        let reply: PositionReply = self
            .codec
            .call_as(Command::Step(StepParams { count, direction }))
            .await?;
        Ok(reply.position)
    }

    /// Return to the zero position
    pub async fn home(&self) -> Result<f64> {
        let reply: PositionReply = self.codec.call_as(Command::Home).await?;
        Ok(reply.position)
    }

    pub async fn get_status(&self) -> Result<StageStatus> {
        self.codec
            .call_as(Command::GetStatus(DeviceParams { device: Device::Stage }))
            .await
    }
}
