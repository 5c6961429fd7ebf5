//! Payload handling module.
//!
//! Splits combined firmware images into segments.

pub mod parser;

pub use parser::{FirmwareImage, Segment, SplitRule, default_rules, format_firmware_content, split};
