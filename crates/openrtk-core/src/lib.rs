//! OpenRTK-Core: command correlation and firmware upgrade for OpenRTK/INS401
//! GNSS/INS receivers.
//!
//! The device speaks a `0x55 0x55` framed command protocol over raw Ethernet
//! or a serial port. This crate turns that fire-and-forget packet stream into
//! timeout-bounded request/response exchanges and drives multi-core firmware
//! upgrades on top of them.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, packet framing, CRC, value codec, NMEA checks
//! - **Payload**: Combined firmware image splitting
//! - **Transport**: Communicator abstraction (serial, mock)
//! - **Engine**: The message center, one in-flight exchange at a time
//! - **Upgrade**: Worker state machine, lifecycle hooks, bracketed pipeline
//! - **Events**: Observer pattern for UI decoupling
//! - **Provider**: Device-facing commands and the upgrade thread
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use openrtk_core::provider::{DeviceProperties, Provider, ProviderConfig};
//! use openrtk_core::transport::{DEFAULT_BAUD_RATE, SerialCommunicator};
//!
//! let comm = Arc::new(SerialCommunicator::open("/dev/ttyUSB0", DEFAULT_BAUD_RATE)?);
//! let provider = Provider::new(comm, ProviderConfig::default(), DeviceProperties::default());
//! provider.start()?;
//!
//! provider.start_upgrade(std::fs::read("openrtk.bin")?)?;
//! if let Some(result) = provider.wait_upgrade() {
//!     result?;
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod engine;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod provider;
pub mod transport;
pub mod upgrade;

// Re-exports for convenience
pub use engine::{ExchangeError, ExchangeResult, MessageCenter, PausePolicy};
pub use events::{NullObserver, RtkEvent, RtkObserver, RtkPhase, TracingObserver};
pub use payload::{FirmwareImage, Segment, SplitRule};
pub use protocol::{Command, FrameError, Framer, Packet, PacketLayout};
pub use provider::{CommandResponse, DeviceProperties, Provider, ProviderConfig, ProviderError};
pub use transport::{Communicator, MockCommunicator, SerialCommunicator, TransportError};
pub use upgrade::{Pipeline, UpgradeEvent, UpgradeWorker, WorkerError};
