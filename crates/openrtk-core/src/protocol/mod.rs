//! Protocol module - framing, decoding and value encoding.

pub mod codec;
pub mod constants;
pub mod decoder;
pub mod frame;
pub mod nmea;

pub use codec::{ParamDescriptor, ParamType, decode_value, encode_value};
pub use constants::*;
pub use decoder::{Packet, PacketDecoder};
pub use frame::{
    Command, FrameError, Framer, MacAddr, PacketLayout, build_frame, build_input_packet,
    build_layout_packet, build_packet, build_uart_packet, filter_for, mnemonic_id,
};
pub use nmea::{NmeaAssembler, NmeaSentence, checksum_verify};
