//! Serial-port communicator built on `serialport`.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::{debug, info, instrument, warn};

use super::traits::{Communicator, TransportError};
use crate::protocol::PacketLayout;

pub const DEFAULT_BAUD_RATE: u32 = 460_800;

/// Read timeout of the port; bounds how long a background read blocks.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Serial communicator. Reads and writes go through separate handles of the
/// same port so the background reader never holds up a writer.
pub struct SerialCommunicator {
    name: String,
    writer: Mutex<Box<dyn SerialPort>>,
    reader: Mutex<Box<dyn SerialPort>>,
    connected: AtomicBool,
}

/// A port that looks like a device candidate.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub product: Option<String>,
}

/// List serial ports, USB adapters first.
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: p.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => PortInfo {
                name: p.port_name,
                vid: None,
                pid: None,
                product: None,
            },
        })
        .collect();
    ports.sort_by_key(|p| (p.vid.is_none(), p.name.clone()));
    ports
}

impl SerialCommunicator {
    /// Open `name` at `baud_rate`, 8N1 without flow control.
    #[instrument(level = "info")]
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let writer = serialport::new(name, baud_rate)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(name.to_string()),
                _ => TransportError::OpenFailed(e.to_string()),
            })?;
        let reader = writer
            .try_clone()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(port = name, baud_rate, "Serial port opened");
        Ok(Self {
            name: name.to_string(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            connected: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn mark_lost(&self, e: &std::io::Error) {
        if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::NotConnected) {
            warn!(port = %self.name, error = %e, "Serial port lost");
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

impl Communicator for SerialCommunicator {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut port = self
            .writer
            .lock()
            .map_err(|_| TransportError::WriteFailed("writer lock poisoned".into()))?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| {
                self.mark_lost(&e);
                TransportError::WriteFailed(e.to_string())
            })?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut port = self
            .reader
            .lock()
            .map_err(|_| TransportError::ReadFailed("reader lock poisoned".into()))?;
        let mut buf = vec![0u8; max_len];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: READ_TIMEOUT.as_millis() as u64,
            }),
            Err(e) => {
                self.mark_lost(&e);
                Err(TransportError::ReadFailed(e.to_string()))
            }
        }
    }

    fn can_write(&self) -> bool {
        self.is_connected()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn layout(&self) -> PacketLayout {
        PacketLayout::Uart
    }
}
