//! Async pump control over a [`PumpLink`].
//!
//! The link is blocking, so every operation is moved onto tokio's blocking pool with
//! `spawn_blocking` and takes the link's mutex there with `blocking_lock`.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::link::{DeviceInfo, PumpLink};
use super::protocol::{self, Command};
use super::PumpDevice;
use crate::adapters::{serial_adapter, Transport};
use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};

/// Opens the transport for a port.
pub type Connector = Arc<dyn Fn(&str, &SerialConfig) -> AppResult<Box<dyn Transport>> + Send + Sync>;

/// Serial pump implementing [`PumpDevice`].
pub struct PumpController {
    port: String,
    serial: SerialConfig,
    connector: Connector,
    link: Arc<Mutex<Option<PumpLink>>>,
}

impl PumpController {
    /// Controller for a pump on a real serial port. Nothing is opened yet.
    pub fn new(port: &str, serial: SerialConfig) -> Self {
        Self::with_connector(port, serial, Arc::new(serial_adapter::connect))
    }

    /// Controller whose transport comes from `connector` instead of a serial port.
    pub fn with_connector(port: &str, serial: SerialConfig, connector: Connector) -> Self {
        Self {
            port: port.to_string(),
            serial,
            connector,
            link: Arc::new(Mutex::new(None)),
        }
    }

    async fn with_link<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PumpLink) -> AppResult<T> + Send + 'static,
    {
        let link = Arc::clone(&self.link);
        tokio::task::spawn_blocking(move || {
            let mut guard = link.blocking_lock();
            let link = guard.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
            op(link)
        })
        .await?
    }

    /// Send a command that must be acknowledged.
    async fn send(&self, command: Command) -> AppResult<()> {
        debug!("[{}] -> {}", self.port, command);
        self.with_link(move |link| link.send(command).map(|_| ()))
            .await
    }

    /// Pressure and flowrate in one exchange.
    pub async fn current_conditions(&self) -> AppResult<(i64, f64)> {
        let port = self.port.clone();
        self.with_link(move |link| {
            let reply = link.send(Command::CurrentConditions)?;
            protocol::parse_current_conditions(&reply).ok_or(DaqError::PumpProtocolTimeout {
                command: Command::CurrentConditions.to_string(),
                port,
                attempts: 1,
            })
        })
        .await
    }
}

#[async_trait]
impl PumpDevice for PumpController {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&self) -> AppResult<()> {
        let port = self.port.clone();
        let serial = self.serial.clone();
        let connector = Arc::clone(&self.connector);
        let slot = Arc::clone(&self.link);
        tokio::task::spawn_blocking(move || {
            let transport = connector(&port, &serial).map_err(|e| {
                warn!("Could not open pump port '{}': {}", port, e);
                e
            })?;
            let link = PumpLink::connect(&port, transport, &serial);
            *slot.blocking_lock() = Some(link);
            Ok(())
        })
        .await?
    }

    async fn close(&self) {
        if let Some(mut link) = self.link.lock().await.take() {
            link.close();
        }
    }

    async fn is_open(&self) -> bool {
        self.with_link(|link| Ok(link.is_open()))
            .await
            .unwrap_or(false)
    }

    async fn run(&self) -> AppResult<()> {
        self.send(Command::Run).await
    }

    async fn stop(&self) -> AppResult<()> {
        self.send(Command::Stop).await
    }

    async fn pressure(&self) -> i64 {
        let port = self.port.clone();
        let reading = self
            .with_link(move |link| {
                let reply = link.send(Command::Pressure)?;
                protocol::parse_pressure(&reply).ok_or(DaqError::PumpProtocolTimeout {
                    command: Command::Pressure.to_string(),
                    port,
                    attempts: 1,
                })
            })
            .await;
        match reading {
            Ok(psi) => psi,
            Err(e) => {
                warn!("[{}] pressure read failed: {}", self.port, e);
                -1
            }
        }
    }

    async fn set_flowrate(&self, ml_per_min: f64) -> AppResult<()> {
        self.with_link(move |link| {
            let command = Command::SetFlowrate {
                ml_per_min,
                resolution: link.info().resolution(),
            };
            debug!("[{}] -> {}", link.port(), command);
            link.send(command).map(|_| ())
        })
        .await
    }

    async fn set_flow_compensation(&self, value: f64) -> AppResult<()> {
        let clamped = protocol::clamp_flow_compensation(value);
        if clamped != value {
            warn!(
                "[{}] flow compensation {} clamped to {}",
                self.port, value, clamped
            );
        }
        self.send(Command::FlowCompensation(clamped)).await
    }

    async fn info(&self) -> DeviceInfo {
        self.with_link(|link| Ok(link.info().clone()))
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    fn config() -> SerialConfig {
        SerialConfig {
            read_timeout_ms: 10,
            settle_delay_ms: 0,
            ..SerialConfig::default()
        }
    }

    fn controller(mock: &MockTransport) -> PumpController {
        let mock = mock.clone();
        PumpController::with_connector(
            "COM7",
            config(),
            Arc::new(
                move |_: &str, _: &SerialConfig| -> AppResult<Box<dyn Transport>> {
                    Ok(Box::new(mock.clone()))
                },
            ),
        )
    }

    fn pump_replies(cmd: &str) -> Option<String> {
        Some(
            match cmd {
                "pr" => "OK,0152/",
                "cc" => "OK,0152,5.00/",
                "cs" => "OK,5.00,6000,0,PSI,0/",
                "mf" => "OK,MF:10.00/",
                _ => "OK/",
            }
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_commands_before_open_fail() {
        let mock = MockTransport::with_responder(pump_replies);
        let pump = controller(&mock);
        assert!(!pump.is_open().await);
        assert!(matches!(
            pump.run().await,
            Err(DaqError::SerialPortNotConnected)
        ));
        assert_eq!(pump.pressure().await, -1);
    }

    #[tokio::test]
    async fn test_run_stop_and_pressure() {
        let mock = MockTransport::with_responder(pump_replies);
        let pump = controller(&mock);
        pump.open().await.unwrap();
        assert!(pump.is_open().await);
        pump.run().await.unwrap();
        assert_eq!(pump.pressure().await, 152);
        assert_eq!(pump.current_conditions().await.unwrap(), (152, 5.0));
        pump.stop().await.unwrap();
        pump.close().await;
        pump.close().await;
        assert!(!pump.is_open().await);
        let writes = mock.writes();
        assert!(writes.contains(&"ru".to_string()));
        assert!(writes.contains(&"st".to_string()));
    }

    #[tokio::test]
    async fn test_flowrate_uses_reported_resolution() {
        let mock = MockTransport::with_responder(pump_replies);
        let pump = controller(&mock);
        pump.open().await.unwrap();
        pump.set_flowrate(5.0).await.unwrap();
        pump.set_flow_compensation(2.0).await.unwrap();
        assert_eq!(mock.count("fi0500"), 1);
        assert_eq!(mock.count("uc1150"), 1);
        assert_eq!(pump.info().await.max_flowrate, Some(10.0));
    }

    #[tokio::test]
    async fn test_error_reply_propagates_from_run() {
        let mock = MockTransport::with_responder(|cmd| match cmd {
            "ru" => Some("Er/".to_string()),
            other => pump_replies(other),
        });
        let pump = controller(&mock);
        pump.open().await.unwrap();
        assert!(matches!(
            pump.run().await,
            Err(DaqError::PumpCommand { .. })
        ));
        assert_eq!(mock.count("ru"), 1);
    }

    #[tokio::test]
    async fn test_bad_pressure_reply_is_sentinel() {
        let mock = MockTransport::with_responder(|cmd| match cmd {
            "pr" => Some("OK,abc/".to_string()),
            other => pump_replies(other),
        });
        let pump = controller(&mock);
        pump.open().await.unwrap();
        assert_eq!(pump.pressure().await, -1);
    }

    #[tokio::test]
    async fn test_cut_off_pressure_reply_is_sentinel() {
        let mock = MockTransport::with_responder(|cmd| match cmd {
            "pr" => Some("OK,01".to_string()),
            other => pump_replies(other),
        });
        let pump = controller(&mock);
        pump.open().await.unwrap();
        assert_eq!(pump.pressure().await, -1);
        assert_eq!(mock.count("pr"), 3);
    }

    #[tokio::test]
    async fn test_open_failure_is_device_unavailable() {
        let pump = PumpController::with_connector(
            "COM9",
            config(),
            Arc::new(|port: &str, _: &SerialConfig| -> AppResult<Box<dyn Transport>> {
                Err(DaqError::DeviceUnavailable {
                    port: port.to_string(),
                    reason: "busy".into(),
                })
            }),
        );
        let err = pump.open().await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceUnavailable { .. }));
    }
}
