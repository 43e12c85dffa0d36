//! Physical link to the dongle - serial UART or TCP socket

use crate::config::{LinkConfig, BAUD_RATE};
use crate::types::ProtocolError;
use serial2::SerialPort;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Read timeout keeping the reader thread responsive to shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// An open connection to the dongle.
///
/// Both flavours hand out cheap clones so one half can sit in the blocking
/// reader thread while the other serves the writer task.
pub enum LinkStream {
    Serial(SerialPort),
    Tcp(TcpStream),
}

impl LinkStream {
    /// Open the link described by the configuration
    #[allow(clippy::missing_errors_doc)]
    pub fn open(config: &LinkConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        match config {
            LinkConfig::Usb { path } | LinkConfig::Din { path } | LinkConfig::Pi { path } => {
                let mut port = SerialPort::open(path, BAUD_RATE)?;
                port.set_read_timeout(READ_TIMEOUT)?;
                Ok(LinkStream::Serial(port))
            }
            LinkConfig::Wifi { address, port } => {
                let stream = TcpStream::connect((address.as_str(), *port))?;
                stream.set_read_timeout(Some(READ_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Ok(LinkStream::Tcp(stream))
            }
        }
    }

    /// Clone the underlying handle for a second owner
    #[allow(clippy::missing_errors_doc)]
    pub fn try_clone(&self) -> Result<Self, ProtocolError> {
        match self {
            LinkStream::Serial(port) => Ok(LinkStream::Serial(port.try_clone()?)),
            LinkStream::Tcp(stream) => Ok(LinkStream::Tcp(stream.try_clone()?)),
        }
    }

    /// Read available bytes, honoring the configured read timeout
    #[allow(clippy::missing_errors_doc)]
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            LinkStream::Serial(port) => port.read(buf),
            LinkStream::Tcp(stream) => {
                let mut reader: &TcpStream = stream;
                reader.read(buf)
            }
        }
    }

    /// Write the whole buffer into the kernel buffer
    #[allow(clippy::missing_errors_doc)]
    pub fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        match self {
            LinkStream::Serial(port) => port.write_all(data),
            LinkStream::Tcp(stream) => {
                let mut writer: &TcpStream = stream;
                writer.write_all(data)
            }
        }
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn flush(&self) -> std::io::Result<()> {
        match self {
            LinkStream::Serial(port) => port.flush(),
            LinkStream::Tcp(stream) => {
                let mut writer: &TcpStream = stream;
                writer.flush()
            }
        }
    }
}
