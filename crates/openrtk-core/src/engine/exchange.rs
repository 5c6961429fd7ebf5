//! Exchange outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an exchange produced no payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Device stayed silent until the deadline.
    #[error("No response for filter {filter:#06x} after {}ms", elapsed.as_millis())]
    NoResponse { filter: u16, elapsed: Duration },

    /// The communicator refused the write.
    #[error("Write for filter {filter:#06x} rejected: {reason}")]
    WriteRejected { filter: u16, reason: String },

    /// Command traffic is suspended while a bulk transfer owns the channel.
    #[error("Message center is paused")]
    Paused,
}

impl ExchangeError {
    pub fn filter(&self) -> Option<u16> {
        match self {
            ExchangeError::NoResponse { filter, .. } | ExchangeError::WriteRejected { filter, .. } => {
                Some(*filter)
            }
            ExchangeError::Paused => None,
        }
    }
}

/// A matched response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResult {
    pub filter: u16,
    pub payload: Vec<u8>,
    pub elapsed: Duration,
}

/// What callers do when `build()` meets a paused center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PausePolicy {
    /// Fail immediately with `Paused`.
    #[default]
    Reject,
    /// Wait for `resume()`, bounded by the call's own timeout.
    Block,
}
