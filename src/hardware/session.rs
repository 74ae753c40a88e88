use log::{debug, info, warn};

use super::interface::{AcquisitionPort, ConnectionInfo, PositionPort};
use crate::error::SweepError;

/// Connected stage, disconnected when dropped
///
/// Created by [`StageSession::connect`]; every exit path out of a sweep,
/// including unwinding, passes through `Drop` and releases the controller.
pub struct StageSession<'a, P: PositionPort> {
    port: &'a mut P,
    info: ConnectionInfo,
    connected: bool,
}

impl<'a, P: PositionPort> StageSession<'a, P> {
    pub fn connect(port: &'a mut P) -> Result<Self, SweepError> {
        let info = port.connect().map_err(|e| match e {
            SweepError::Connection(msg) => SweepError::Connection(msg),
            other => SweepError::Connection(other.to_string()),
        })?;
        info!(
            "Connected to stage controller {} ({})",
            info.serial_number, info.description
        );
        Ok(Self {
            port,
            info,
            connected: true,
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn move_to(&mut self, angle: f64) -> Result<(), SweepError> {
        debug!("Moving stage to {:.4} deg", angle);
        self.port.move_to(angle).map_err(|e| match e {
            SweepError::MotionFault { .. } => e,
            other => SweepError::MotionFault {
                target: angle,
                reason: other.to_string(),
            },
        })
    }

    pub fn current_position(&mut self) -> Result<f64, SweepError> {
        self.port.current_position()
    }

    /// Disconnect now and report the result instead of logging it
    pub fn disconnect(mut self) -> Result<(), SweepError> {
        self.connected = false;
        info!("Disconnecting stage controller {}", self.info.serial_number);
        self.port.disconnect()
    }
}

impl<P: PositionPort> Drop for StageSession<'_, P> {
    fn drop(&mut self) {
        if self.connected {
            self.connected = false;
            info!("Disconnecting stage controller {}", self.info.serial_number);
            if let Err(e) = self.port.disconnect() {
                warn!("Stage disconnect failed: {}", e);
            }
        }
    }
}

/// Acquisition module borrowed for one capture, finished when dropped
pub struct AcquisitionGuard<'a, A: AcquisitionPort> {
    port: &'a mut A,
    released: bool,
}

impl<'a, A: AcquisitionPort> AcquisitionGuard<'a, A> {
    /// Take the module without starting it; `finish` is owed from here on
    pub fn new(port: &'a mut A) -> Self {
        Self {
            port,
            released: false,
        }
    }

    pub fn port(&mut self) -> &mut A {
        &mut *self.port
    }

    /// Finish the module and surface its error
    pub fn release(mut self) -> Result<(), SweepError> {
        self.released = true;
        self.port.finish()
    }
}

impl<A: AcquisitionPort> Drop for AcquisitionGuard<'_, A> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.port.finish() {
                warn!("Releasing acquisition module failed: {}", e);
            }
        }
    }
}
