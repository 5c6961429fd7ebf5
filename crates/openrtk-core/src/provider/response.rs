//! Tagged command results handed to front-ends.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::engine::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PacketType {
    Success,
    Error,
    Ping,
    Conf,
    DeviceInfo,
    InputParams,
    InputParam,
}

/// `{packetType, data}` as consumed by UI/CLI layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(rename = "packetType")]
    pub packet_type: PacketType,
    #[serde(default)]
    pub data: Value,
}

impl CommandResponse {
    pub fn new(packet_type: PacketType, data: Value) -> Self {
        Self { packet_type, data }
    }

    pub fn success(data: Value) -> Self {
        Self::new(PacketType::Success, data)
    }

    pub fn error(data: Value) -> Self {
        Self::new(PacketType::Error, data)
    }

    /// Device answered with a non-zero status.
    pub fn device_error(code: i64) -> Self {
        Self::error(json!({ "error": code }))
    }

    /// Exchange failed before any answer; keeps silence and rejection apart.
    pub fn from_exchange_error(e: &ExchangeError) -> Self {
        let kind = match e {
            ExchangeError::NoResponse { .. } => "noResponse",
            ExchangeError::WriteRejected { .. } => "writeRejected",
            ExchangeError::Paused => "paused",
        };
        let mut data = json!({ "error": e.to_string(), "kind": kind });
        if let ExchangeError::NoResponse { elapsed, .. } = e {
            data["elapsedMs"] = json!(elapsed.as_millis() as u64);
        }
        if let Some(filter) = e.filter() {
            data["filter"] = json!(filter);
        }
        Self::error(data)
    }

    pub fn is_success(&self) -> bool {
        self.packet_type != PacketType::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_serialized_shape() {
        let response = CommandResponse::new(PacketType::InputParams, json!([1, 2]));
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(text, r#"{"packetType":"inputParams","data":[1,2]}"#);
    }

    #[test]
    fn test_silent_and_rejected_are_distinguishable() {
        let silent = CommandResponse::from_exchange_error(&ExchangeError::NoResponse {
            filter: 0x6750,
            elapsed: Duration::from_millis(1000),
        });
        let rejected = CommandResponse::from_exchange_error(&ExchangeError::WriteRejected {
            filter: 0x6750,
            reason: "closed".into(),
        });
        assert_eq!(silent.data["kind"], "noResponse");
        assert_eq!(silent.data["elapsedMs"], 1000);
        assert_eq!(rejected.data["kind"], "writeRejected");
        assert!(!silent.is_success());
        assert!(CommandResponse::device_error(3).data["error"] == 3);
    }
}
