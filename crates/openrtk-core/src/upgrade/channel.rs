//! The narrow channel workers talk through.

use std::time::Duration;

use crate::engine::{ExchangeError, ExchangeResult, MessageCenter};
use crate::protocol::Command;
use crate::transport::Communicator;

/// What an upgrade worker needs from the link: fire-and-forget writes and
/// bulk exchanges that keep working while command traffic is paused.
pub trait Channel: Send + Sync {
    fn write(&self, command: &Command) -> Result<(), ExchangeError>;

    fn write_read(&self, command: &Command, timeout: Duration) -> Result<ExchangeResult, ExchangeError>;
}

impl<C: Communicator + 'static> Channel for MessageCenter<C> {
    fn write(&self, command: &Command) -> Result<(), ExchangeError> {
        MessageCenter::write(self, command)
    }

    fn write_read(&self, command: &Command, timeout: Duration) -> Result<ExchangeResult, ExchangeError> {
        MessageCenter::write_read(self, command, timeout)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    use crate::protocol::{PacketDecoder, PacketLayout};

    type Responder = Box<dyn Fn(&[u8; 2], &[u8]) -> Result<Vec<u8>, ExchangeError> + Send + Sync>;

    /// Channel double: records every packet written and answers exchanges
    /// through a responder closure given the packet id and payload.
    pub struct ScriptedChannel {
        layout: PacketLayout,
        responder: Responder,
        pub sent: Mutex<Vec<([u8; 2], Vec<u8>, bool)>>,
    }

    impl ScriptedChannel {
        pub fn new(
            layout: PacketLayout,
            responder: impl Fn(&[u8; 2], &[u8]) -> Result<Vec<u8>, ExchangeError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                layout,
                responder: Box::new(responder),
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Acknowledge everything with an empty payload.
        pub fn acking(layout: PacketLayout) -> Self {
            Self::new(layout, |_, _| Ok(Vec::new()))
        }

        /// Ids written so far, in order.
        pub fn ids(&self) -> Vec<[u8; 2]> {
            self.sent.lock().unwrap().iter().map(|(id, _, _)| *id).collect()
        }

        fn decode(&self, command: &Command) -> ([u8; 2], Vec<u8>) {
            let mut packets = PacketDecoder::new(self.layout).push(command.bytes());
            let packet = packets.remove(0);
            (packet.id, packet.payload)
        }
    }

    impl Channel for ScriptedChannel {
        fn write(&self, command: &Command) -> Result<(), ExchangeError> {
            let (id, payload) = self.decode(command);
            self.sent.lock().unwrap().push((id, payload, false));
            Ok(())
        }

        fn write_read(&self, command: &Command, _timeout: Duration) -> Result<ExchangeResult, ExchangeError> {
            let (id, payload) = self.decode(command);
            self.sent.lock().unwrap().push((id, payload.clone(), true));
            let response = (self.responder)(&id, &payload)?;
            Ok(ExchangeResult {
                filter: command.filter(),
                payload: response,
                elapsed: Duration::ZERO,
            })
        }
    }
}
