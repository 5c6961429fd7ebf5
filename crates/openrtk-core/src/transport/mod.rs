//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod traits;

pub use mock::MockCommunicator;
pub use serial::{DEFAULT_BAUD_RATE, PortInfo, SerialCommunicator, list_ports};
pub use traits::{Communicator, TransportError};
