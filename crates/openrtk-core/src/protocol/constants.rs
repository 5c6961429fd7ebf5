//! Wire constants for the OpenRTK / INS401 command protocol.

/// Two-byte command identifier as it appears on the wire.
pub type CommandId = [u8; 2];

// Framing
pub const PACKET_PREAMBLE: [u8; 2] = [0x55, 0x55];
pub const MAC_LEN: usize = 6;
pub const LINK_HEADER_LEN: usize = MAC_LEN * 2 + 2;
pub const CRC_LEN: usize = 2;
/// Preamble + id + u32 length.
pub const ETHERNET_PACKET_OVERHEAD: usize = 2 + 2 + 4 + CRC_LEN;
/// Preamble + id + u8 length.
pub const UART_PACKET_OVERHEAD: usize = 2 + 2 + 1 + CRC_LEN;
/// Largest payload accepted by the incoming decoder before it resyncs.
pub const MAX_INCOMING_PAYLOAD: usize = 64 * 1024;

// Bootloader / upgrade commands (main core)
pub const CMD_JUMP_BOOTLOADER: CommandId = [0x01, 0xAA];
pub const CMD_JUMP_APPLICATION: CommandId = [0x02, 0xAA];
pub const CMD_WRITE_APP: CommandId = [0x03, 0xAA];
pub const CMD_SELECT_CORE: CommandId = [0x04, 0xAA];
pub const CMD_SDK_WRITE: CommandId = [0x05, 0xAA];
pub const CMD_SDK_FINISH: CommandId = [0x06, 0xAA];

// IMU sub-core mode switch, sent without the link header
pub const CMD_IMU_JUMP_BOOTLOADER: CommandId = [0x49, 0x4A];
pub const CMD_IMU_JUMP_APPLICATION: CommandId = [0x41, 0x4A];

// UART bootloader commands
pub const CMD_UART_JUMP_BOOTLOADER: CommandId = *b"JI";
pub const CMD_UART_JUMP_APPLICATION: CommandId = *b"JA";
pub const CMD_UART_WRITE_APP: CommandId = *b"WA";
pub const CMD_UART_SDK_WRITE: CommandId = *b"WS";
pub const CMD_UART_SDK_FINISH: CommandId = *b"SF";

// Data forwarding
pub const CMD_RTCM_FORWARD: CommandId = [0x02, 0x0B];

// Parameter commands
pub const CMD_SET_PARAMS: CommandId = [0x03, 0xCC];

/// Mnemonic commands built with [`crate::protocol::build_input_packet`].
pub mod mnemonics {
    pub const GET_ALL_PARAMS: &str = "gA";
    pub const GET_PARAM_BLOCK: &str = "gB";
    pub const GET_PARAM: &str = "gP";
    pub const UPDATE_PARAM: &str = "uP";
    pub const SAVE_CONFIG: &str = "sC";
    pub const RESET_DEFAULTS: &str = "rD";
}

// Core selectors carried by CMD_SELECT_CORE
pub const CORE_RTK: u8 = b'0';
pub const CORE_INS: u8 = b'1';

// NMEA line framing
pub const NMEA_START: u8 = b'$';
pub const NMEA_CHECKSUM_DELIMITER: char = '*';
pub const NMEA_GGA_TALKER: &str = "$GPGGA";

// Defaults
pub const DEFAULT_BLOCK_SIZE: usize = 192;
pub const FIRMWARE_ALIGNMENT: usize = 16;
pub const FIRMWARE_PAD_BYTE: u8 = 0xFF;
pub const PARAM_PAGE_SIZE: u32 = 10;
pub const PARAM_PAGE_FIRST_ID: u32 = 2;
