//! Outgoing frame construction.
//!
//! A packet is `55 55 | id (2) | length | payload | crc16 (BE)`. The length
//! field is a little-endian u32 on Ethernet and a single byte on UART. Ethernet
//! frames are additionally prefixed with a link header carrying the
//! destination MAC, the source MAC and the packet length.

use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc::{CRC_16_SPI_FUJITSU, Crc};
use thiserror::Error;

use super::codec::{ParamDescriptor, encode_value};
use super::constants::*;

/// CRC-16 with poly 0x1021 and init 0x1D0F, computed over id, length and payload.
pub const PACKET_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_SPI_FUJITSU);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown command or type: {0}")]
    UnknownCommand(String),
    #[error("Malformed sentence: {0}")]
    MalformedSentence(String),
    #[error("Payload of {len} bytes does not fit a {layout} packet")]
    PayloadTooLarge { len: usize, layout: PacketLayout },
    #[error("Invalid value for {ty}: {value}")]
    InvalidValue { ty: String, value: String },
}

/// Length-field flavour of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketLayout {
    /// u32 LE length, used on the Ethernet link.
    #[default]
    Ethernet,
    /// u8 length, used on serial ports.
    Uart,
}

impl PacketLayout {
    pub fn length_width(&self) -> usize {
        match self {
            PacketLayout::Ethernet => 4,
            PacketLayout::Uart => 1,
        }
    }

    pub fn overhead(&self) -> usize {
        match self {
            PacketLayout::Ethernet => ETHERNET_PACKET_OVERHEAD,
            PacketLayout::Uart => UART_PACKET_OVERHEAD,
        }
    }
}

impl fmt::Display for PacketLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketLayout::Ethernet => write!(f, "ethernet"),
            PacketLayout::Uart => write!(f, "uart"),
        }
    }
}

/// 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; MAC_LEN]);

impl MacAddr {
    pub fn octets(&self) -> [u8; MAC_LEN] {
        self.0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Response filter for a command id: the id read as a big-endian u16.
pub fn filter_for(id: CommandId) -> u16 {
    BigEndian::read_u16(&id)
}

/// A framed command ready to be written, paired with the filter its response
/// will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    bytes: Vec<u8>,
    filter: u16,
}

impl Command {
    /// Wrap already framed bytes; the filter is derived from `id`.
    pub fn new(id: CommandId, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            filter: filter_for(id),
        }
    }

    /// Wrap framed bytes with an explicit filter.
    pub fn with_filter(bytes: Vec<u8>, filter: u16) -> Self {
        Self { bytes, filter }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn filter(&self) -> u16 {
        self.filter
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn crc_bytes(body: &[u8]) -> [u8; CRC_LEN] {
    PACKET_CRC.checksum(body).to_be_bytes()
}

/// Build an Ethernet-layout packet (no link header).
pub fn build_packet(command_id: CommandId, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + payload.len());
    body.extend_from_slice(&command_id);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, payload.len() as u32);
    body.extend_from_slice(&len);
    body.extend_from_slice(payload);

    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.extend_from_slice(&PACKET_PREAMBLE);
    packet.extend_from_slice(&body);
    packet.extend_from_slice(&crc_bytes(&body));
    packet
}

/// Build a UART-layout packet. Payloads above 255 bytes cannot be expressed.
pub fn build_uart_packet(command_id: CommandId, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u8::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        layout: PacketLayout::Uart,
    })?;

    let mut body = Vec::with_capacity(3 + payload.len());
    body.extend_from_slice(&command_id);
    body.push(len);
    body.extend_from_slice(payload);

    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.extend_from_slice(&PACKET_PREAMBLE);
    packet.extend_from_slice(&body);
    packet.extend_from_slice(&crc_bytes(&body));
    Ok(packet)
}

/// Build a packet in the given layout.
pub fn build_layout_packet(
    layout: PacketLayout,
    command_id: CommandId,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    match layout {
        PacketLayout::Ethernet => Ok(build_packet(command_id, payload)),
        PacketLayout::Uart => build_uart_packet(command_id, payload),
    }
}

/// Build a complete Ethernet frame.
///
/// With `with_link_header` the packet is prefixed by `dst | src | u16 LE length`;
/// without it the frame starts at the preamble. A packet too long for the
/// u16 link length is refused; callers chunk upstream.
pub fn build_frame(
    dst: MacAddr,
    src: MacAddr,
    command_id: CommandId,
    payload: &[u8],
    with_link_header: bool,
) -> Result<Vec<u8>, FrameError> {
    let packet = build_packet(command_id, payload);
    if !with_link_header {
        return Ok(packet);
    }

    let link_len = u16::try_from(packet.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        layout: PacketLayout::Ethernet,
    })?;
    let mut frame = Vec::with_capacity(LINK_HEADER_LEN + packet.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, link_len);
    frame.extend_from_slice(&len);
    frame.extend_from_slice(&packet);
    Ok(frame)
}

/// Frames commands for one link: layout plus, on Ethernet, the address pair
/// that goes into the link header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Framer {
    layout: PacketLayout,
    /// `(dst, src)`
    link: Option<(MacAddr, MacAddr)>,
}

impl Framer {
    pub fn ethernet(dst: MacAddr, src: MacAddr) -> Self {
        Self {
            layout: PacketLayout::Ethernet,
            link: Some((dst, src)),
        }
    }

    pub fn uart() -> Self {
        Self {
            layout: PacketLayout::Uart,
            link: None,
        }
    }

    pub fn new(layout: PacketLayout, link: Option<(MacAddr, MacAddr)>) -> Self {
        Self { layout, link }
    }

    pub fn layout(&self) -> PacketLayout {
        self.layout
    }

    /// Frame `payload` under `id`, with the link header when the link has one.
    pub fn command(&self, id: CommandId, payload: &[u8]) -> Result<Command, FrameError> {
        let bytes = match (self.layout, self.link) {
            (PacketLayout::Ethernet, Some((dst, src))) => build_frame(dst, src, id, payload, true)?,
            _ => build_layout_packet(self.layout, id, payload)?,
        };
        Ok(Command::new(id, bytes))
    }

    /// Frame `payload` under `id` without any link header.
    pub fn bare(&self, id: CommandId, payload: &[u8]) -> Result<Command, FrameError> {
        Ok(Command::new(id, build_layout_packet(self.layout, id, payload)?))
    }

    /// Frame a mnemonic get/set command.
    pub fn input(
        &self,
        mnemonic: &str,
        params: Option<&[ParamDescriptor]>,
        param: Option<u32>,
        value: Option<&serde_json::Value>,
    ) -> Result<Command, FrameError> {
        let id = mnemonic_id(mnemonic)?;
        let payload = build_input_payload(mnemonic, params, param, value)?;
        self.command(id, &payload)
    }
}

/// Convert a two-character mnemonic such as `"gP"` into a command id.
pub fn mnemonic_id(mnemonic: &str) -> Result<CommandId, FrameError> {
    let bytes = mnemonic.as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphanumeric) {
        return Err(FrameError::UnknownCommand(mnemonic.to_string()));
    }
    Ok([bytes[0], bytes[1]])
}

/// Build the payload of a parameter get/set command.
///
/// `gP` carries the parameter id; `uP` carries the id followed by the value
/// encoded with the type declared for that id in `params`.
pub fn build_input_payload(
    mnemonic: &str,
    params: Option<&[ParamDescriptor]>,
    param: Option<u32>,
    value: Option<&serde_json::Value>,
) -> Result<Vec<u8>, FrameError> {
    let Some(param_id) = param else {
        return Ok(Vec::new());
    };

    let mut payload = param_id.to_le_bytes().to_vec();
    if let Some(value) = value {
        let descriptor = params
            .and_then(|table| table.iter().find(|p| p.param_id == param_id))
            .ok_or_else(|| FrameError::UnknownCommand(format!("{mnemonic}: paramId {param_id}")))?;
        payload.extend(encode_value(&descriptor.ty, value)?);
    }
    Ok(payload)
}

/// Build a framed mnemonic command in the given layout.
pub fn build_input_packet(
    layout: PacketLayout,
    mnemonic: &str,
    params: Option<&[ParamDescriptor]>,
    param: Option<u32>,
    value: Option<&serde_json::Value>,
) -> Result<Command, FrameError> {
    let id = mnemonic_id(mnemonic)?;
    let payload = build_input_payload(mnemonic, params, param, value)?;
    let bytes = build_layout_packet(layout, id, &payload)?;
    Ok(Command::new(id, bytes))
}
