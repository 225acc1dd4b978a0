//! Serial adapter for RS-232/USB-serial pumps
//!
//! Wraps the serialport crate. The port is opened with a short internal read timeout;
//! the pump link layers its own per-attempt deadline on top of it.

use log::debug;
use std::io::{self, Read, Write};

use super::Transport;
use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Open serial connection to one pump
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// The actual serial port
    #[cfg(feature = "instrument_serial")]
    port: Box<dyn SerialPort>,
}

impl SerialAdapter {
    /// Open `port_name` at the configured baud rate, 8N1, no flow control.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, config: &SerialConfig) -> AppResult<Self> {
        let port = serialport::new(port_name, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(config.read_timeout())
            .open()
            .map_err(|e| DaqError::DeviceUnavailable {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            "Serial port '{}' opened at {} baud",
            port_name, config.baud_rate
        );
        Ok(Self {
            port_name: port_name.to_string(),
            port,
        })
    }

    /// Always fails: serial support is compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(port_name: &str, _config: &SerialConfig) -> AppResult<Self> {
        debug!("Serial support disabled, cannot open '{}'", port_name);
        Err(DaqError::SerialFeatureDisabled)
    }

    /// Name of the port this adapter was opened on
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// Open `port_name` as a boxed [`Transport`].
pub fn connect(port_name: &str, config: &SerialConfig) -> AppResult<Box<dyn Transport>> {
    Ok(Box::new(SerialAdapter::open(port_name, config)?))
}

#[cfg(feature = "instrument_serial")]
impl Read for SerialAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

#[cfg(feature = "instrument_serial")]
impl Write for SerialAdapter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

#[cfg(feature = "instrument_serial")]
impl Transport for SerialAdapter {
    fn is_connected(&mut self) -> bool {
        // an unplugged USB adapter fails every status query
        self.port.bytes_to_read().is_ok()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Read for SerialAdapter {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::NotConnected))
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Write for SerialAdapter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::NotConnected))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Transport for SerialAdapter {
    fn is_connected(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_is_unavailable() {
        let result = SerialAdapter::open("/dev/scale-daq-no-such-port", &SerialConfig::default());
        match result {
            Err(DaqError::DeviceUnavailable { port, .. }) => {
                assert_eq!(port, "/dev/scale-daq-no-such-port")
            }
            Err(DaqError::SerialFeatureDisabled) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a port that does not exist"),
        }
    }
}
