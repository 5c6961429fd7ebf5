//! Mock communicator for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::traits::{Communicator, TransportError};
use crate::engine::lock;
use crate::protocol::{MacAddr, PacketDecoder, PacketLayout, build_frame, build_layout_packet};

/// How long an empty read blocks, standing in for a port read timeout.
const MOCK_READ_WAIT: Duration = Duration::from_millis(2);

/// Mock communicator for exercising the engine and provider without hardware.
///
/// Replies can be scripted per response filter: every write whose packet id
/// matches a scripted filter queues the next reply for reading.
pub struct MockCommunicator {
    layout: PacketLayout,
    /// Bytes waiting to be read.
    rx_queue: Mutex<VecDeque<Vec<u8>>>,
    /// Captured writes.
    write_log: Mutex<Vec<Vec<u8>>>,
    /// Scripted replies keyed by filter.
    replies: Mutex<HashMap<u16, VecDeque<Vec<u8>>>>,
    connected: Mutex<bool>,
    writable: Mutex<bool>,
    macs: Option<(MacAddr, MacAddr)>,
}

impl MockCommunicator {
    pub fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            rx_queue: Mutex::new(VecDeque::new()),
            write_log: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            connected: Mutex::new(true),
            writable: Mutex::new(true),
            macs: None,
        }
    }

    /// Ethernet mock with fixed host/device addresses.
    pub fn ethernet() -> Self {
        let mut mock = Self::new(PacketLayout::Ethernet);
        mock.macs = Some((
            MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            MacAddr([0x04, 0x00, 0x00, 0x00, 0x00, 0x02]),
        ));
        mock
    }

    pub fn uart() -> Self {
        Self::new(PacketLayout::Uart)
    }

    /// Frame a packet the way the device would send it.
    pub fn device_frame(&self, id: [u8; 2], payload: &[u8]) -> Vec<u8> {
        match (self.layout, self.macs) {
            (PacketLayout::Ethernet, Some((src, dst))) => {
                build_frame(src, dst, id, payload, true).unwrap_or_default()
            }
            _ => build_layout_packet(self.layout, id, payload).unwrap_or_default(),
        }
    }

    /// Reply with `payload` the next time a packet with `id` is written.
    pub fn respond_to(&self, id: [u8; 2], payload: &[u8]) {
        let frame = self.device_frame(id, payload);
        lock(&self.replies)
            .entry(u16::from_be_bytes(id))
            .or_default()
            .push_back(frame);
    }

    /// Queue bytes to be read as if the device had sent them unprompted.
    pub fn inject(&self, data: &[u8]) {
        lock(&self.rx_queue).push_back(data.to_vec());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Ids of every packet written so far, in order.
    pub fn written_ids(&self) -> Vec<[u8; 2]> {
        let mut decoder = PacketDecoder::new(self.layout);
        self.get_writes()
            .iter()
            .flat_map(|w| decoder.push(w))
            .map(|p| p.id)
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    /// Make subsequent writes fail.
    pub fn set_writable(&self, writable: bool) {
        *lock(&self.writable) = writable;
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }
}

impl Default for MockCommunicator {
    fn default() -> Self {
        Self::ethernet()
    }
}

impl Communicator for MockCommunicator {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        if !*lock(&self.writable) {
            return Err(TransportError::WriteFailed("mock rejects writes".into()));
        }
        lock(&self.write_log).push(data.to_vec());

        let mut decoder = PacketDecoder::new(self.layout);
        for packet in decoder.push(data) {
            let reply = lock(&self.replies)
                .get_mut(&packet.filter())
                .and_then(VecDeque::pop_front);
            if let Some(reply) = reply {
                lock(&self.rx_queue).push_back(reply);
            }
        }
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        let next = lock(&self.rx_queue).pop_front();
        match next {
            Some(mut data) => {
                if data.len() > max_len {
                    let rest = data.split_off(max_len);
                    lock(&self.rx_queue).push_front(rest);
                }
                Ok(data)
            }
            None => {
                thread::sleep(MOCK_READ_WAIT);
                Err(TransportError::Timeout {
                    timeout_ms: MOCK_READ_WAIT.as_millis() as u64,
                })
            }
        }
    }

    fn can_write(&self) -> bool {
        *lock(&self.connected) && *lock(&self.writable)
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    fn layout(&self) -> PacketLayout {
        self.layout
    }

    fn src_mac(&self) -> Option<MacAddr> {
        self.macs.map(|(src, _)| src)
    }

    fn dst_mac(&self) -> Option<MacAddr> {
        self.macs.map(|(_, dst)| dst)
    }
}
