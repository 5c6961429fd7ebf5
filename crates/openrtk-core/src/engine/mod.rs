//! Command/response correlation.

pub mod center;
pub mod exchange;

pub(crate) use center::lock;
pub use center::MessageCenter;
pub use exchange::{ExchangeError, ExchangeResult, PausePolicy};
