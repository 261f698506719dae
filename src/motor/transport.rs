// Byte transport to the controller
//
// The controller speaks a plain request/response protocol with no length
// prefix, so reads are time-bounded: whatever arrived before the timeout is
// returned, possibly nothing.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Default serial configuration for the controller
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_PORT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Return the bytes received within `timeout`. Never blocks past it.
    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes)
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_available(timeout)
    }
}

/// Serial-port transport
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_PORT_TIMEOUT_MS))
            .open()?;
        debug!("Opened {} at {} baud", port_name, baudrate);

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        // The controller answers within a few ms; wait out the window, then
        // drain the input buffer without blocking.
        std::thread::sleep(timeout);

        let pending = self.port.bytes_to_read()? as usize;
        let mut buf = vec![0u8; pending];
        if pending > 0 {
            self.port.read_exact(&mut buf)?;
        }
        Ok(buf)
    }
}
