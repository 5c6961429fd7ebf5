//! Type-directed encoding of parameter values.
//!
//! Parameter types come from the device's declared parameter table. All
//! numeric types are little-endian; `charN` and `string` are zero-padded.

use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::FrameError;

/// One entry of the device's parameter table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    #[serde(rename = "paramId")]
    pub param_id: u32,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// Declared parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
    /// Fixed-width text (`char8`, `char16`, ...).
    Chars(usize),
}

impl ParamType {
    pub fn width(&self) -> usize {
        match self {
            ParamType::Int8 | ParamType::Uint8 => 1,
            ParamType::Int16 | ParamType::Uint16 => 2,
            ParamType::Int32 | ParamType::Uint32 | ParamType::Float => 4,
            ParamType::Int64 | ParamType::Uint64 | ParamType::Double => 8,
            ParamType::Chars(n) => *n,
        }
    }
}

impl FromStr for ParamType {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "int8" => ParamType::Int8,
            "uint8" => ParamType::Uint8,
            "int16" => ParamType::Int16,
            "uint16" => ParamType::Uint16,
            "int32" => ParamType::Int32,
            "uint32" => ParamType::Uint32,
            "int64" => ParamType::Int64,
            "uint64" => ParamType::Uint64,
            "float" => ParamType::Float,
            "double" => ParamType::Double,
            "string" => ParamType::Chars(8),
            other => match other.strip_prefix("char").map(str::parse::<usize>) {
                Some(Ok(n)) if n > 0 => ParamType::Chars(n),
                _ => return Err(FrameError::UnknownCommand(other.to_string())),
            },
        };
        Ok(ty)
    }
}

fn invalid(ty: &str, value: &Value) -> FrameError {
    FrameError::InvalidValue {
        ty: ty.to_string(),
        value: value.to_string(),
    }
}

fn as_i64(ty: &str, value: &Value) -> Result<i64, FrameError> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| invalid(ty, value))
}

fn as_u64(ty: &str, value: &Value) -> Result<u64, FrameError> {
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        })
        .ok_or_else(|| invalid(ty, value))
}

/// Encode `value` as the declared type `ty`.
pub fn encode_value(ty: &str, value: &Value) -> Result<Vec<u8>, FrameError> {
    let param_type: ParamType = ty.parse()?;
    let mut buf = vec![0u8; param_type.width()];

    match param_type {
        ParamType::Int8 => {
            let v = i8::try_from(as_i64(ty, value)?).map_err(|_| invalid(ty, value))?;
            buf[0] = v as u8;
        }
        ParamType::Uint8 => {
            buf[0] = u8::try_from(as_u64(ty, value)?).map_err(|_| invalid(ty, value))?;
        }
        ParamType::Int16 => {
            let v = i16::try_from(as_i64(ty, value)?).map_err(|_| invalid(ty, value))?;
            LittleEndian::write_i16(&mut buf, v);
        }
        ParamType::Uint16 => {
            let v = u16::try_from(as_u64(ty, value)?).map_err(|_| invalid(ty, value))?;
            LittleEndian::write_u16(&mut buf, v);
        }
        ParamType::Int32 => {
            let v = i32::try_from(as_i64(ty, value)?).map_err(|_| invalid(ty, value))?;
            LittleEndian::write_i32(&mut buf, v);
        }
        ParamType::Uint32 => {
            let v = u32::try_from(as_u64(ty, value)?).map_err(|_| invalid(ty, value))?;
            LittleEndian::write_u32(&mut buf, v);
        }
        ParamType::Int64 => LittleEndian::write_i64(&mut buf, as_i64(ty, value)?),
        ParamType::Uint64 => LittleEndian::write_u64(&mut buf, as_u64(ty, value)?),
        ParamType::Float => {
            let v = value.as_f64().ok_or_else(|| invalid(ty, value))?;
            LittleEndian::write_f32(&mut buf, v as f32);
        }
        ParamType::Double => {
            let v = value.as_f64().ok_or_else(|| invalid(ty, value))?;
            LittleEndian::write_f64(&mut buf, v);
        }
        ParamType::Chars(n) => {
            let text = value.as_str().ok_or_else(|| invalid(ty, value))?;
            let bytes = text.as_bytes();
            if bytes.len() > n {
                return Err(invalid(ty, value));
            }
            buf[..bytes.len()].copy_from_slice(bytes);
        }
    }

    Ok(buf)
}

/// Decode one value of type `ty` from the front of `data`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_value(ty: &str, data: &[u8]) -> Result<(Value, usize), FrameError> {
    let param_type: ParamType = ty.parse()?;
    let width = param_type.width();
    if data.len() < width {
        return Err(FrameError::InvalidValue {
            ty: ty.to_string(),
            value: format!("{} bytes", data.len()),
        });
    }
    let raw = &data[..width];

    let value = match param_type {
        ParamType::Int8 => Value::from(raw[0] as i8),
        ParamType::Uint8 => Value::from(raw[0]),
        ParamType::Int16 => Value::from(LittleEndian::read_i16(raw)),
        ParamType::Uint16 => Value::from(LittleEndian::read_u16(raw)),
        ParamType::Int32 => Value::from(LittleEndian::read_i32(raw)),
        ParamType::Uint32 => Value::from(LittleEndian::read_u32(raw)),
        ParamType::Int64 => Value::from(LittleEndian::read_i64(raw)),
        ParamType::Uint64 => Value::from(LittleEndian::read_u64(raw)),
        ParamType::Float => Value::from(LittleEndian::read_f32(raw) as f64),
        ParamType::Double => Value::from(LittleEndian::read_f64(raw)),
        ParamType::Chars(_) => {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
            Value::from(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
    };

    Ok((value, width))
}
