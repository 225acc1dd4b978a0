//! Scripted in-memory transport.
//!
//! Stands in for a serial port in tests and in simulation. Each command written
//! (terminated by `\r`) is logged, and the reply for it is queued for reading: first
//! from the scripted reply queue, then from the responder closure, then the default
//! reply. Commands without any reply leave the read side empty, which the pump link
//! sees as a timeout.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use super::Transport;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct MockState {
    replies: VecDeque<String>,
    responder: Option<Responder>,
    default_reply: Option<String>,
    pending: VecDeque<u8>,
    partial: Vec<u8>,
    writes: Vec<String>,
    disconnected: bool,
}

/// Cloneable handle to one scripted port; clones share the same state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Transport with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands with `responder`; `None` means no reply at all.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let mock = Self::new();
        mock.state.lock().responder = Some(Box::new(responder));
        mock
    }

    /// Queue a reply for the next command written.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.state.lock().replies.push_back(reply.into());
    }

    /// Reply used when neither the queue nor the responder has one.
    pub fn set_default_reply(&self, reply: impl Into<String>) {
        self.state.lock().default_reply = Some(reply.into());
    }

    /// Every command written so far, without line endings.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Count of writes of exactly `command`.
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.as_str() == command)
            .count()
    }

    /// Simulate the cable being pulled.
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    /// Plug the port back in.
    pub fn reconnect(&self) {
        self.state.lock().disconnected = false;
    }
}

impl MockState {
    fn reply_for(&mut self, command: &str) -> Option<String> {
        if let Some(reply) = self.replies.pop_front() {
            return Some(reply);
        }
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(command) {
                return Some(reply);
            }
        }
        self.default_reply.clone()
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mock port disconnected")
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(broken_pipe());
        }
        let n = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(broken_pipe());
        }
        for &byte in buf {
            if byte == b'\r' {
                let command = String::from_utf8_lossy(&state.partial).into_owned();
                state.partial.clear();
                let reply = state.reply_for(&command);
                state.writes.push(command);
                if let Some(reply) = reply {
                    state.pending.extend(reply.into_bytes());
                }
            } else {
                state.partial.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn is_connected(&mut self) -> bool {
        !self.state.lock().disconnected
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(mock: &mut MockTransport) -> String {
        let mut buf = [0u8; 64];
        let n = mock.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_scripted_replies_come_first() {
        let mut mock = MockTransport::with_responder(|cmd| Some(format!("OK,{}/", cmd)));
        mock.push_reply("OK,0100/");
        mock.write_all(b"pr\r").unwrap();
        assert_eq!(read_all(&mut mock), "OK,0100/");
        mock.write_all(b"id\r").unwrap();
        assert_eq!(read_all(&mut mock), "OK,id/");
        assert_eq!(mock.writes(), vec!["pr", "id"]);
    }

    #[test]
    fn test_silent_port_reads_nothing() {
        let mut mock = MockTransport::new();
        mock.write_all(b"pr\r").unwrap();
        assert_eq!(read_all(&mut mock), "");
        assert_eq!(mock.count("pr"), 1);
    }

    #[test]
    fn test_disconnect_fails_io() {
        let mut mock = MockTransport::new();
        let handle = mock.clone();
        handle.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.write_all(b"ru\r").is_err());
        handle.reconnect();
        assert!(mock.is_connected());
    }
}
