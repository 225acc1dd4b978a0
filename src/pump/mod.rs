//! Pump devices.
//!
//! Everything above this module talks to pumps through [`PumpDevice`]. There is one
//! serial implementation, [`PumpController`], and one simulated implementation,
//! [`MockPump`]. A [`PumpFactory`] hands out devices by port name so a test run can
//! be pointed at either.

use async_trait::async_trait;
use std::sync::Arc;

pub mod controller;
pub mod link;
pub mod mock;
pub mod protocol;

pub use controller::PumpController;
pub use link::{DeviceInfo, PumpLink};
pub use mock::{MockPump, MockPumpFactory, PressureProfile};

use crate::config::SerialConfig;
use crate::error::AppResult;

/// Pump capabilities used by a test run.
#[async_trait]
pub trait PumpDevice: Send + Sync {
    /// Port the pump lives on.
    fn port(&self) -> &str;

    /// Open the port and identify the pump.
    async fn open(&self) -> AppResult<()>;

    /// Release the port. Never fails; safe to call when already closed.
    async fn close(&self);

    /// Whether the port is open and still answering.
    async fn is_open(&self) -> bool;

    /// Start pumping.
    async fn run(&self) -> AppResult<()>;

    /// Stop pumping.
    async fn stop(&self) -> AppResult<()>;

    /// Head pressure in psi, or `-1` when it could not be read.
    async fn pressure(&self) -> i64;

    /// Flowrate in mL/min.
    async fn set_flowrate(&self, ml_per_min: f64) -> AppResult<()>;

    /// Flowrate compensation factor, clamped to the pump's accepted range.
    async fn set_flow_compensation(&self, value: f64) -> AppResult<()>;

    /// What the pump reported when opened.
    async fn info(&self) -> DeviceInfo;
}

/// Creates the device for a port.
pub trait PumpFactory: Send + Sync {
    /// Device for `port`, not opened yet.
    fn create(&self, port: &str) -> Arc<dyn PumpDevice>;
}

/// Factory for pumps on real serial ports.
#[derive(Debug, Clone, Default)]
pub struct SerialPumpFactory {
    serial: SerialConfig,
}

impl SerialPumpFactory {
    /// Factory opening ports with `serial`.
    pub fn new(serial: SerialConfig) -> Self {
        Self { serial }
    }
}

impl PumpFactory for SerialPumpFactory {
    fn create(&self, port: &str) -> Arc<dyn PumpDevice> {
        Arc::new(PumpController::new(port, self.serial.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_factory_names_port() {
        let factory = SerialPumpFactory::new(SerialConfig::default());
        let pump = factory.create("/dev/ttyUSB3");
        assert_eq!(pump.port(), "/dev/ttyUSB3");
    }
}
