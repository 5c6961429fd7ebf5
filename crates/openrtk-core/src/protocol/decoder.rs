//! Streaming decoder for incoming packets.
//!
//! Bytes arrive in arbitrary slices from the read path. The decoder scans for
//! the preamble, waits for a complete packet, checks the CRC and yields the
//! command id and payload. Anything in front of the preamble (link header,
//! line noise) is discarded.

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use super::constants::*;
use super::frame::{PACKET_CRC, PacketLayout, filter_for};

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: CommandId,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn filter(&self) -> u16 {
        filter_for(self.id)
    }
}

#[derive(Debug, Default)]
pub struct PacketDecoder {
    layout: PacketLayout,
    buf: Vec<u8>,
    dropped: u64,
}

impl PacketDecoder {
    pub fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            buf: Vec::new(),
            dropped: 0,
        }
    }

    /// Packets rejected for a bad CRC or an implausible length.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Feed raw bytes, returning every packet completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Packet> {
        self.buf.extend_from_slice(data);
        let mut packets = Vec::new();
        let len_width = self.layout.length_width();
        let header_len = 4 + len_width;

        loop {
            let Some(start) = self
                .buf
                .windows(2)
                .position(|w| w == PACKET_PREAMBLE.as_slice())
            else {
                // Keep a trailing half preamble for the next push.
                let keep = usize::from(self.buf.last() == Some(&PACKET_PREAMBLE[0]));
                let cut = self.buf.len() - keep;
                self.buf.drain(..cut);
                break;
            };
            self.buf.drain(..start);

            if self.buf.len() < header_len {
                break;
            }

            let payload_len = match self.layout {
                PacketLayout::Ethernet => LittleEndian::read_u32(&self.buf[4..8]) as usize,
                PacketLayout::Uart => self.buf[4] as usize,
            };
            if payload_len > MAX_INCOMING_PAYLOAD {
                self.dropped += 1;
                self.buf.drain(..1);
                continue;
            }

            let total = header_len + payload_len + CRC_LEN;
            if self.buf.len() < total {
                break;
            }

            let body = &self.buf[2..total - CRC_LEN];
            let expected = u16::from_be_bytes([self.buf[total - 2], self.buf[total - 1]]);
            if PACKET_CRC.checksum(body) != expected {
                trace!(expected, "Dropping packet with bad CRC");
                self.dropped += 1;
                self.buf.drain(..1);
                continue;
            }

            packets.push(Packet {
                id: [self.buf[2], self.buf[3]],
                payload: self.buf[header_len..header_len + payload_len].to_vec(),
            });
            self.buf.drain(..total);
        }

        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{MacAddr, build_frame, build_packet, build_uart_packet};

    #[test]
    fn test_decode_frame_with_link_header() {
        let frame = build_frame(
            MacAddr([0x55; 6]),
            MacAddr([1; 6]),
            [0x04, 0xAA],
            &[1, 2, 3],
            true,
        )
        .unwrap();
        let mut decoder = PacketDecoder::new(PacketLayout::Ethernet);
        let packets = decoder.push(&frame);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].id, [0x04, 0xAA]);
        assert_eq!(packets[0].payload, vec![1, 2, 3]);
        assert_eq!(packets[0].filter(), 0x04AA);
    }

    #[test]
    fn test_decode_split_across_pushes() {
        let mut stream = build_packet(*b"gP", &[9; 12]);
        stream.extend(build_packet(*b"sC", &[0; 4]));

        let mut decoder = PacketDecoder::new(PacketLayout::Ethernet);
        let mut packets = Vec::new();
        for chunk in stream.chunks(5) {
            packets.extend(decoder.push(chunk));
        }
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0].id, b"gP");
        assert_eq!(&packets[1].id, b"sC");
    }

    #[test]
    fn test_corrupted_packet_is_dropped() {
        let mut bad = build_packet(*b"gA", &[1, 2, 3, 4]);
        bad[9] ^= 0xFF;
        let good = build_packet(*b"gA", &[5]);

        let mut decoder = PacketDecoder::new(PacketLayout::Ethernet);
        let mut stream = bad;
        stream.extend(&good);
        let packets = decoder.push(&stream);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, vec![5]);
        assert!(decoder.dropped() >= 1);
    }

    #[test]
    fn test_uart_layout() {
        let packet = build_uart_packet(*b"WA", &[7, 7]).unwrap();
        let mut decoder = PacketDecoder::new(PacketLayout::Uart);
        let packets = decoder.push(&packet);
        assert_eq!(packets[0].payload, vec![7, 7]);
    }
}
