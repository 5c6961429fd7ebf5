//! Communicator abstraction.
//!
//! The core only needs raw writes and raw reads. Whether the bytes travel over
//! a raw Ethernet link or a serial port is the communicator's business; link
//! addresses are exposed only by link-framed transports.

use thiserror::Error;

use crate::protocol::{Framer, MacAddr, PacketLayout};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw byte channel to the device.
///
/// This trait enables:
/// - A serial implementation on `serialport`
/// - Integrator-supplied raw Ethernet implementations
/// - A mock implementation for unit testing
pub trait Communicator: Send + Sync {
    /// Write raw bytes.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available, waiting at most the transport's read
    /// timeout. An empty vector or `Timeout` both mean "nothing yet".
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Whether a write would currently be accepted.
    fn can_write(&self) -> bool;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Packet layout spoken on this link.
    fn layout(&self) -> PacketLayout;

    /// Host address, for link-framed transports.
    fn src_mac(&self) -> Option<MacAddr> {
        None
    }

    /// Device address, for link-framed transports.
    fn dst_mac(&self) -> Option<MacAddr> {
        None
    }

    /// Framer matching this link.
    fn framer(&self) -> Framer {
        let link = self.dst_mac().zip(self.src_mac());
        Framer::new(self.layout(), link)
    }
}
