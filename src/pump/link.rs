//! Blocking request/response link to one pump.
//!
//! `PumpLink` exclusively owns the transport of a single pump. Every exchange writes
//! the command, waits the settle delay and then reads until the `/` terminator or the
//! read timeout. Replies without `OK`, or cut off before the terminator, are retried;
//! an `Er/` reply ends the exchange with [`DaqError::PumpCommand`] on the spot.
//!
//! All methods block. Async callers go through [`super::PumpController`], which runs
//! them on the blocking pool.

use log::{debug, info, warn};
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use super::protocol::{self, Command, DEFAULT_FLOWRATE_RESOLUTION, LINE_ENDING, TERMINATOR};
use crate::adapters::{SerialAdapter, Transport};
use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{with_retries, Attempt, RetryPolicy};

/// Pause between polls of an empty read side.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// What the pump told us about itself during [`PumpLink::identify`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    /// Identification string from `id`
    pub firmware: Option<String>,
    /// mL/min
    pub max_flowrate: Option<f64>,
    /// mL/min per flowrate step
    pub flowrate_resolution: Option<f64>,
    /// Unit name from `pu`, usually `PSI`
    pub pressure_units: Option<String>,
    /// Pressure ceiling from `mp`, in the pump's units
    pub max_pressure: Option<i64>,
}

impl DeviceInfo {
    /// Reported resolution, or 0.01 mL/min when the pump did not say.
    pub fn resolution(&self) -> f64 {
        self.flowrate_resolution
            .unwrap_or(DEFAULT_FLOWRATE_RESOLUTION)
    }
}

/// Exclusive command channel to one pump.
pub struct PumpLink {
    port: String,
    transport: Option<Box<dyn Transport>>,
    retry: RetryPolicy,
    read_timeout: Duration,
    info: DeviceInfo,
}

impl PumpLink {
    /// Open the serial port and identify the pump behind it.
    pub fn open(port: &str, config: &SerialConfig) -> AppResult<Self> {
        let adapter = SerialAdapter::open(port, config).map_err(|e| {
            warn!("Could not open pump port '{}': {}", port, e);
            e
        })?;
        Ok(Self::connect(port, Box::new(adapter), config))
    }

    /// Identify the pump behind an already open transport.
    pub fn connect(port: &str, transport: Box<dyn Transport>, config: &SerialConfig) -> Self {
        let mut link = Self::with_transport(port, transport, config);
        link.identify();
        link
    }

    /// Wrap a transport without talking to the pump.
    pub fn with_transport(port: &str, transport: Box<dyn Transport>, config: &SerialConfig) -> Self {
        Self {
            port: port.to_string(),
            transport: Some(transport),
            retry: RetryPolicy::from(config),
            read_timeout: config.read_timeout(),
            info: DeviceInfo::default(),
        }
    }

    /// Port name the link was opened on
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Device info from the last [`identify`](Self::identify)
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Send `code` and return the reply.
    ///
    /// Retried while the reply lacks `OK` or no terminator was read. When every
    /// attempt is used up the last reply, possibly empty or partial, is returned and a
    /// warning logged.
    pub fn command(&mut self, code: &str) -> AppResult<String> {
        self.exchange(code).map(|outcome| outcome.reply)
    }

    /// Like [`command`](Self::command) but an unacknowledged reply is an error.
    pub fn query(&mut self, code: &str) -> AppResult<String> {
        let Exchange {
            reply,
            attempts,
            accepted,
        } = self.exchange(code)?;
        if accepted {
            Ok(reply)
        } else {
            Err(DaqError::PumpProtocolTimeout {
                command: code.to_string(),
                port: self.port.clone(),
                attempts,
            })
        }
    }

    /// Typed form of [`query`](Self::query).
    pub fn send(&mut self, command: Command) -> AppResult<String> {
        self.query(&command.to_string())
    }

    fn exchange(&mut self, code: &str) -> AppResult<Exchange> {
        let port = self.port.as_str();
        let transport = self
            .transport
            .as_mut()
            .ok_or(DaqError::SerialPortNotConnected)?;
        let settle = self.retry.settle_delay;
        let timeout = self.read_timeout;

        let outcome = with_retries(&self.retry, |attempt| {
            match exchange_once(&mut **transport, code, settle, timeout) {
                Err(e) => Attempt::Fatal(DaqError::Io(e)),
                Ok((reply, _)) if protocol::is_error(&reply) => {
                    Attempt::Fatal(DaqError::PumpCommand {
                        command: code.to_string(),
                        response: reply,
                        port: port.to_string(),
                    })
                }
                Ok((reply, true)) if protocol::is_ack(&reply) => Attempt::Accepted(reply),
                Ok((reply, terminated)) => {
                    debug!(
                        "[{}] '{}' attempt {} got '{}'{}",
                        port,
                        code,
                        attempt,
                        reply,
                        if terminated { "" } else { " (unterminated)" }
                    );
                    Attempt::Rejected(reply)
                }
            }
        })
        .map_err(|e| {
            warn!("[{}] '{}' failed: {}", port, code, e);
            e
        })?;

        if !outcome.accepted {
            warn!(
                "[{}] no valid response to '{}' after {} attempts",
                port, code, outcome.attempts
            );
        }
        Ok(Exchange {
            reply: outcome.value,
            attempts: outcome.attempts,
            accepted: outcome.accepted,
        })
    }

    /// Query firmware, limits and flowrate resolution.
    ///
    /// A failed query is logged and leaves its field unset.
    pub fn identify(&mut self) -> &DeviceInfo {
        let mut info = DeviceInfo::default();

        match self.send(Command::Identify) {
            Ok(reply) => info.firmware = protocol::simple_field(&reply).map(str::to_string),
            Err(e) => warn!("[{}] identify failed: {}", self.port, e),
        }
        match self.send(Command::MaxFlow) {
            Ok(reply) => {
                info.max_flowrate = protocol::value_field(&reply).and_then(|v| v.parse().ok())
            }
            Err(e) => warn!("[{}] max flowrate query failed: {}", self.port, e),
        }
        match self.send(Command::CurrentState) {
            Ok(reply) => info.flowrate_resolution = protocol::parse_state_resolution(&reply),
            Err(e) => warn!("[{}] state query failed: {}", self.port, e),
        }
        match self.send(Command::PressureUnits) {
            Ok(reply) => {
                info.pressure_units = protocol::value_field(&reply).map(str::to_string)
            }
            Err(e) => warn!("[{}] pressure units query failed: {}", self.port, e),
        }
        match self.send(Command::MaxPressure) {
            Ok(reply) => {
                info.max_pressure = protocol::value_field(&reply)
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(|v| v.round() as i64)
            }
            Err(e) => warn!("[{}] max pressure query failed: {}", self.port, e),
        }

        info!(
            "[{}] pump {:?}, max {:?} mL/min, resolution {} mL/min",
            self.port,
            info.firmware,
            info.max_flowrate,
            info.resolution()
        );
        self.info = info;
        &self.info
    }

    /// Release the port. Safe to call more than once.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("[{}] port closed", self.port);
        }
    }

    /// False once closed or when the port stops answering.
    pub fn is_open(&mut self) -> bool {
        self.transport
            .as_mut()
            .is_some_and(|transport| transport.is_connected())
    }
}

impl Drop for PumpLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Result of a retried exchange.
struct Exchange {
    reply: String,
    attempts: u32,
    /// A terminated `OK` reply arrived
    accepted: bool,
}

/// One write/read round. The flag is true when the `/` terminator was read.
fn exchange_once(
    transport: &mut dyn Transport,
    code: &str,
    settle: Duration,
    timeout: Duration,
) -> io::Result<(String, bool)> {
    transport.clear_input()?;
    transport.write_all(format!("{}{}", code, LINE_ENDING).as_bytes())?;
    transport.flush()?;
    thread::sleep(settle);

    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut buf = [0u8; 64];
    let mut terminated = false;
    loop {
        match transport.read(&mut buf) {
            Ok(0) => thread::sleep(POLL_INTERVAL),
            Ok(n) => {
                reply.extend_from_slice(&buf[..n]);
                if let Some(end) = reply.iter().position(|&b| b == TERMINATOR) {
                    reply.truncate(end + 1);
                    terminated = true;
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            break;
        }
    }
    Ok((String::from_utf8_lossy(&reply).trim().to_string(), terminated))
}
