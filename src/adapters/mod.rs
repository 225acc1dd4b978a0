//! Byte transports the pump link talks through.
//!
//! [`Transport`] is the seam between the protocol and the wire: the serial adapter
//! for real pumps and a scripted in-memory transport for tests and simulation.

use std::io::{self, Read, Write};

pub mod mock;
pub mod serial_adapter;

pub use mock::MockTransport;
pub use serial_adapter::SerialAdapter;

/// Blocking, exclusively owned byte stream to one device.
pub trait Transport: Read + Write + Send {
    /// Whether the underlying port still answers.
    fn is_connected(&mut self) -> bool;

    /// Drop any unread input so a reply is not mistaken for the previous one.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}
