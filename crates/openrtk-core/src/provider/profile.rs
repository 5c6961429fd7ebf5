//! Per-transport device capabilities: which worker each segment becomes and
//! how the mode switches are framed.

use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use super::config::{ProviderConfig, ms};
use crate::protocol::{
    CMD_IMU_JUMP_APPLICATION, CMD_IMU_JUMP_BOOTLOADER, CMD_JUMP_APPLICATION, CMD_JUMP_BOOTLOADER,
    CMD_SDK_FINISH, CMD_SDK_WRITE, CMD_SELECT_CORE, CMD_UART_JUMP_APPLICATION, CMD_UART_JUMP_BOOTLOADER,
    CMD_UART_SDK_FINISH, CMD_UART_SDK_WRITE, CMD_UART_WRITE_APP, CMD_WRITE_APP, CORE_INS, CORE_RTK,
    CommandId, Framer,
};
use crate::upgrade::{
    BlockWriter, ContentSupplier, Delivery, FirmwareSpec, HookContext, Identity, JumpSpec, SdkSpec,
    UpgradeEvent, UpgradeWorker, WorkerFactory,
};

/// A transport-specific device profile.
pub trait DeviceProfile: WorkerFactory + Send + Sync {
    fn name(&self) -> &'static str;

    fn framer(&self) -> Framer;
}

fn settle(delay: Duration) -> impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static {
    move |ctx| {
        debug!(worker = ctx.worker, settle_ms = delay.as_millis() as u64, "Waiting for bootloader");
        thread::sleep(delay);
        Ok(())
    }
}

/// Tell the bootloader which core the following blocks are for and how many
/// bytes to expect.
fn select_core(
    framer: Framer,
    core: u8,
    delay: Duration,
    timeout: Duration,
) -> impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static {
    move |ctx| {
        let total = u32::try_from(ctx.total).context("content too large for select-core")?;
        let mut payload = vec![b'C', core];
        payload.extend_from_slice(&total.to_be_bytes());
        let command = framer.command(CMD_SELECT_CORE, &payload)?;

        thread::sleep(delay);
        ctx.channel
            .write_read(&command, timeout)
            .context("Cannot run set core command")?;
        debug!(worker = ctx.worker, core = %(core as char), total, "Core selected");
        Ok(())
    }
}

fn blocks(framer: Framer, write_id: CommandId, config: &ProviderConfig) -> BlockWriter {
    BlockWriter {
        framer,
        write_id,
        block_size: config.block_size,
        ack_timeout: ms(config.block_ack_timeout_ms),
    }
}

/// INS401 over the raw Ethernet link.
#[derive(Debug, Clone)]
pub struct EthernetProfile {
    framer: Framer,
    config: ProviderConfig,
}

impl EthernetProfile {
    pub fn new(framer: Framer, config: ProviderConfig) -> Self {
        Self { framer, config }
    }

    fn main_core_worker(&self, tag: &str, core: u8, settle_ms: u64, identity: Identity, content: ContentSupplier) -> UpgradeWorker {
        let spec = FirmwareSpec {
            blocks: blocks(self.framer, CMD_WRITE_APP, &self.config),
        };
        let mut worker = UpgradeWorker::firmware(tag, identity, spec, content);
        worker
            .on(UpgradeEvent::FirstPacket, settle(ms(settle_ms)))
            .on(
                UpgradeEvent::BeforeWrite,
                select_core(
                    self.framer,
                    core,
                    ms(self.config.pre_select_delay_ms),
                    ms(self.config.select_core_timeout_ms),
                ),
            );
        worker
    }

    fn jump(&self, id: CommandId, identity: Identity) -> Option<JumpSpec> {
        // IMU sub-core mode switch, sent without the link header.
        let (command, delivery) = match identity {
            Identity::MainRtk => (
                self.framer.command(id, &[]).ok()?,
                Delivery::Exchange(ms(self.config.jump_timeout_ms)),
            ),
            Identity::SubImu => (self.framer.bare(id, &[]).ok()?, Delivery::Raw),
        };
        Some(JumpSpec {
            command,
            delivery,
            settle: ms(self.config.jump_settle_ms),
        })
    }
}

impl WorkerFactory for EthernetProfile {
    fn build_worker(&self, tag: &str, content: ContentSupplier) -> Option<UpgradeWorker> {
        let config = &self.config;
        match tag {
            "rtk" => Some(self.main_core_worker(tag, CORE_RTK, config.main_settle_ms, Identity::MainRtk, content)),
            "ins" => Some(self.main_core_worker(tag, CORE_INS, config.main_settle_ms, Identity::MainRtk, content)),
            "imu" => Some(self.main_core_worker(tag, CORE_RTK, config.imu_settle_ms, Identity::SubImu, content)),
            "sdk" => Some(UpgradeWorker::sdk(
                tag,
                SdkSpec {
                    blocks: blocks(self.framer, CMD_SDK_WRITE, config),
                    finish_id: CMD_SDK_FINISH,
                    finish_timeout: ms(config.sdk_finish_timeout_ms),
                },
                content,
            )),
            _ => None,
        }
    }

    fn jump_bootloader(&self, identity: Identity) -> Option<UpgradeWorker> {
        let id = match identity {
            Identity::MainRtk => CMD_JUMP_BOOTLOADER,
            Identity::SubImu => CMD_IMU_JUMP_BOOTLOADER,
        };
        Some(UpgradeWorker::jump_bootloader(identity, self.jump(id, identity)?))
    }

    fn jump_application(&self, identity: Identity) -> Option<UpgradeWorker> {
        let id = match identity {
            Identity::MainRtk => CMD_JUMP_APPLICATION,
            Identity::SubImu => CMD_IMU_JUMP_APPLICATION,
        };
        Some(UpgradeWorker::jump_application(identity, self.jump(id, identity)?))
    }
}

impl DeviceProfile for EthernetProfile {
    fn name(&self) -> &'static str {
        "INS401 (ethernet)"
    }

    fn framer(&self) -> Framer {
        self.framer
    }
}

/// OpenRTK over a serial port: main core and SDK only.
#[derive(Debug, Clone)]
pub struct UartProfile {
    framer: Framer,
    config: ProviderConfig,
}

impl UartProfile {
    pub fn new(framer: Framer, config: ProviderConfig) -> Self {
        Self { framer, config }
    }

    fn jump(&self, id: CommandId) -> Option<JumpSpec> {
        Some(JumpSpec {
            command: self.framer.command(id, &[]).ok()?,
            delivery: Delivery::Raw,
            settle: ms(self.config.jump_settle_ms),
        })
    }
}

impl WorkerFactory for UartProfile {
    fn build_worker(&self, tag: &str, content: ContentSupplier) -> Option<UpgradeWorker> {
        let config = &self.config;
        match tag {
            "rtk" => {
                let spec = FirmwareSpec {
                    blocks: blocks(self.framer, CMD_UART_WRITE_APP, config),
                };
                let mut worker = UpgradeWorker::firmware(tag, Identity::MainRtk, spec, content);
                worker.on(UpgradeEvent::FirstPacket, settle(ms(config.uart_settle_ms)));
                Some(worker)
            }
            "sdk" => Some(UpgradeWorker::sdk(
                tag,
                SdkSpec {
                    blocks: blocks(self.framer, CMD_UART_SDK_WRITE, config),
                    finish_id: CMD_UART_SDK_FINISH,
                    finish_timeout: ms(config.sdk_finish_timeout_ms),
                },
                content,
            )),
            _ => None,
        }
    }

    fn jump_bootloader(&self, identity: Identity) -> Option<UpgradeWorker> {
        match identity {
            Identity::MainRtk => Some(UpgradeWorker::jump_bootloader(identity, self.jump(CMD_UART_JUMP_BOOTLOADER)?)),
            Identity::SubImu => None,
        }
    }

    fn jump_application(&self, identity: Identity) -> Option<UpgradeWorker> {
        match identity {
            Identity::MainRtk => Some(UpgradeWorker::jump_application(identity, self.jump(CMD_UART_JUMP_APPLICATION)?)),
            Identity::SubImu => None,
        }
    }
}

impl DeviceProfile for UartProfile {
    fn name(&self) -> &'static str {
        "OpenRTK (uart)"
    }

    fn framer(&self) -> Framer {
        self.framer
    }
}
