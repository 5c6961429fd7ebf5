//! Firmware upgrade: workers, their lifecycle hooks and the pipeline that
//! sequences them.

pub mod channel;
pub mod hooks;
pub mod pipeline;
pub mod worker;

pub use channel::Channel;
pub use hooks::{Hook, HookContext, UpgradeEvent};
pub use pipeline::{Pipeline, WorkerFactory};
pub use worker::{
    BlockWriter, ContentSupplier, Delivery, FirmwareSpec, Identity, JumpSpec, SDK_IMAGE_CRC,
    SdkSpec, UpgradeWorker, WorkerError, WorkerGroup, WorkerKind, WorkerState,
};
