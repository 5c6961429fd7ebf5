//! Per-segment upgrade worker.
//!
//! Every variant walks the same states. Firmware and SDK workers stream their
//! content in fixed-size blocks and differ only in block framing, the ack they
//! expect and the final verification. Jump workers carry no content and go
//! straight from `Armed` to `Done`.

use std::fmt;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use crc::{CRC_32_ISO_HDLC, Crc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::channel::Channel;
use super::hooks::{Hook, HookContext, Hooks, UpgradeEvent};
use crate::events::{RtkEvent, RtkObserver};
use crate::protocol::{Command, CommandId, Framer};

/// CRC over the whole SDK image, sent with the finish command.
pub const SDK_IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Largest block a one-byte length field can describe.
const MAX_BLOCK_SIZE: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Armed,
    FirstPacketSent,
    Writing,
    Verifying,
    Done,
    Error,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Done | WorkerState::Error)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Armed => "armed",
            WorkerState::FirstPacketSent => "first_packet_sent",
            WorkerState::Writing => "writing",
            WorkerState::Verifying => "verifying",
            WorkerState::Done => "done",
            WorkerState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerGroup {
    #[default]
    Firmware,
    BeforeAll,
    AfterAll,
}

/// Physical core a worker writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    MainRtk,
    SubImu,
}

impl Identity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Identity::MainRtk => "MAIN_RTK",
            Identity::SubImu => "SUB_IMU",
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Worker {worker} failed while {state}: {cause}")]
pub struct WorkerError {
    pub worker: String,
    pub state: WorkerState,
    pub cause: String,
}

/// Produces a worker's content on demand.
pub type ContentSupplier = Box<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Block streaming parameters shared by the content-carrying variants.
#[derive(Debug, Clone, Copy)]
pub struct BlockWriter {
    pub framer: Framer,
    pub write_id: CommandId,
    pub block_size: usize,
    pub ack_timeout: Duration,
}

/// Firmware writes: `offset u32 BE | len u8 | data`, acked by an empty
/// payload or a zero status byte.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareSpec {
    pub blocks: BlockWriter,
}

/// SDK writes: `seq u16 BE | data | xor(data)`, acked by echoing `seq`.
/// Finished by `total u32 BE | crc32 BE`, acked by a zero status byte.
#[derive(Debug, Clone, Copy)]
pub struct SdkSpec {
    pub blocks: BlockWriter,
    pub finish_id: CommandId,
    pub finish_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Write and wait for the echo.
    Exchange(Duration),
    /// Write only.
    Raw,
}

#[derive(Debug, Clone)]
pub struct JumpSpec {
    pub command: Command,
    pub delivery: Delivery,
    /// Wait after the switch for the target to come up.
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub enum WorkerKind {
    Firmware(FirmwareSpec),
    Sdk(SdkSpec),
    JumpBootloader(JumpSpec),
    JumpApplication(JumpSpec),
}

impl WorkerKind {
    fn label(&self) -> &'static str {
        match self {
            WorkerKind::Firmware(_) => "firmware",
            WorkerKind::Sdk(_) => "sdk",
            WorkerKind::JumpBootloader(_) => "jump_bootloader",
            WorkerKind::JumpApplication(_) => "jump_application",
        }
    }
}

/// One staged unit of an upgrade run.
pub struct UpgradeWorker {
    tag: String,
    identity: Option<Identity>,
    group: WorkerGroup,
    kind: WorkerKind,
    content: Option<ContentSupplier>,
    hooks: Hooks,
    state: WorkerState,
}

impl fmt::Debug for UpgradeWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeWorker")
            .field("name", &self.name())
            .field("kind", &self.kind.label())
            .field("group", &self.group)
            .field("state", &self.state)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl UpgradeWorker {
    pub fn firmware(
        tag: impl Into<String>,
        identity: Identity,
        spec: FirmwareSpec,
        content: ContentSupplier,
    ) -> Self {
        Self::with_kind(tag, Some(identity), WorkerKind::Firmware(spec), Some(content))
    }

    pub fn sdk(tag: impl Into<String>, spec: SdkSpec, content: ContentSupplier) -> Self {
        Self::with_kind(tag, None, WorkerKind::Sdk(spec), Some(content))
    }

    pub fn jump_bootloader(identity: Identity, spec: JumpSpec) -> Self {
        Self::with_kind("jump_bootloader", Some(identity), WorkerKind::JumpBootloader(spec), None)
    }

    pub fn jump_application(identity: Identity, spec: JumpSpec) -> Self {
        Self::with_kind("jump_application", Some(identity), WorkerKind::JumpApplication(spec), None)
    }

    fn with_kind(
        tag: impl Into<String>,
        identity: Option<Identity>,
        kind: WorkerKind,
        content: Option<ContentSupplier>,
    ) -> Self {
        Self {
            tag: tag.into(),
            identity,
            group: WorkerGroup::Firmware,
            kind,
            content,
            hooks: Hooks::default(),
            state: WorkerState::Idle,
        }
    }

    pub fn with_group(mut self, group: WorkerGroup) -> Self {
        self.group = group;
        self
    }

    /// Subscribe to a lifecycle event.
    pub fn on(
        &mut self,
        event: UpgradeEvent,
        hook: impl Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        let hook: Hook = Box::new(hook);
        self.hooks.on(event, hook);
        self
    }

    pub fn has_hook(&self, event: UpgradeEvent) -> bool {
        self.hooks.has(event)
    }

    /// Segment tag for content workers, the switch direction for jumps.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    /// Display name: `tag(IDENTITY)` or just the tag.
    pub fn name(&self) -> String {
        match self.identity {
            Some(identity) => format!("{}({})", self.tag, identity),
            None => self.tag.clone(),
        }
    }

    pub fn group(&self) -> WorkerGroup {
        self.group
    }

    pub fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Plain firmware worker; only these take part in bracketing.
    pub fn is_firmware(&self) -> bool {
        matches!(self.kind, WorkerKind::Firmware(_))
    }

    pub fn is_jump(&self) -> bool {
        matches!(
            self.kind,
            WorkerKind::JumpBootloader(_) | WorkerKind::JumpApplication(_)
        )
    }

    /// Register into a pipeline. Content stays unmaterialized.
    pub fn arm(&mut self) {
        if self.state == WorkerState::Idle {
            self.state = WorkerState::Armed;
        }
    }

    fn ctx<'a>(&'a self, name: &'a str, channel: &'a dyn Channel, total: usize, current: usize) -> HookContext<'a> {
        HookContext {
            worker: name,
            total,
            current,
            cause: None,
            channel,
        }
    }

    fn fire(
        &self,
        event: UpgradeEvent,
        name: &str,
        channel: &dyn Channel,
        total: usize,
        current: usize,
    ) -> Result<(), String> {
        self.hooks
            .fire(event, &self.ctx(name, channel, total, current))
            .map_err(|e| format!("{event} handler failed: {e:#}"))
    }

    /// Run the worker to completion.
    #[instrument(skip_all, fields(worker = %self.name()))]
    pub fn run(&mut self, channel: &dyn Channel, observer: &dyn RtkObserver) -> Result<(), WorkerError> {
        self.arm();
        if self.state != WorkerState::Armed {
            return Err(WorkerError {
                worker: self.name(),
                state: self.state,
                cause: "worker already ran".into(),
            });
        }

        let name = self.name();
        let outcome = match self.kind.clone() {
            WorkerKind::Firmware(spec) => self.stream(&name, channel, observer, Variant::Firmware(spec)),
            WorkerKind::Sdk(spec) => self.stream(&name, channel, observer, Variant::Sdk(spec)),
            WorkerKind::JumpBootloader(spec) | WorkerKind::JumpApplication(spec) => {
                self.jump(&name, channel, &spec)
            }
        };

        match outcome {
            Ok(()) => {
                self.state = WorkerState::Done;
                info!("Worker done");
                Ok(())
            }
            Err(cause) => {
                let failed_in = self.state;
                self.state = WorkerState::Error;
                warn!(state = %failed_in, cause = %cause, "Worker failed");
                let ctx = HookContext {
                    cause: Some(&cause),
                    ..self.ctx(&name, channel, 0, 0)
                };
                if let Err(e) = self.hooks.fire(UpgradeEvent::Error, &ctx) {
                    debug!(error = %e, "error handler failed");
                }
                Err(WorkerError {
                    worker: name,
                    state: failed_in,
                    cause,
                })
            }
        }
    }

    fn jump(&mut self, name: &str, channel: &dyn Channel, spec: &JumpSpec) -> Result<(), String> {
        match spec.delivery {
            Delivery::Exchange(timeout) => {
                channel
                    .write_read(&spec.command, timeout)
                    .map_err(|e| e.to_string())?;
            }
            Delivery::Raw => channel.write(&spec.command).map_err(|e| e.to_string())?,
        }
        if !spec.settle.is_zero() {
            debug!(settle_ms = spec.settle.as_millis() as u64, "Waiting for mode switch");
            thread::sleep(spec.settle);
        }
        self.fire(UpgradeEvent::Finish, name, channel, 0, 0)
    }

    fn stream(
        &mut self,
        name: &str,
        channel: &dyn Channel,
        observer: &dyn RtkObserver,
        variant: Variant,
    ) -> Result<(), String> {
        let blocks = variant.blocks();
        if blocks.block_size == 0 || blocks.block_size > MAX_BLOCK_SIZE {
            return Err(format!("block size {} out of range", blocks.block_size));
        }
        let content = match &self.content {
            Some(supply) => supply(),
            None => return Err("no content supplier".into()),
        };
        if content.is_empty() {
            return Err("content is empty".into());
        }

        let total = content.len();
        let block_count = total.div_ceil(blocks.block_size);
        info!(total, blocks = block_count, "Streaming content");

        // A one-block image has no later block to write, so the
        // pre-write hook runs before it.
        if block_count == 1 {
            self.fire(UpgradeEvent::BeforeWrite, name, channel, total, 0)?;
        }

        let mut written = 0;
        for (seq, block) in content.chunks(blocks.block_size).enumerate() {
            let offset = seq * blocks.block_size;
            let command = variant.block_command(offset, seq, block)?;
            let ack = channel
                .write_read(&command, blocks.ack_timeout)
                .map_err(|e| format!("block at offset {offset}: {e}"))?;
            variant.check_ack(seq, offset, &ack.payload)?;

            written = offset + block.len();
            if seq == 0 {
                self.state = WorkerState::FirstPacketSent;
                self.fire(UpgradeEvent::FirstPacket, name, channel, total, written)?;
                if block_count > 1 {
                    self.fire(UpgradeEvent::BeforeWrite, name, channel, total, written)?;
                }
                self.state = WorkerState::Writing;
            }

            self.fire(UpgradeEvent::Progress, name, channel, total, written)?;
            observer.on_event(&RtkEvent::Progress {
                worker: name.to_string(),
                current: written as u64,
                total: total as u64,
            });
        }
        self.fire(UpgradeEvent::AfterWrite, name, channel, total, total)?;

        self.state = WorkerState::Verifying;
        variant.verify(channel, &content, written)?;
        self.fire(UpgradeEvent::Finish, name, channel, total, total)
    }
}

/// Variant-specific pieces of block streaming.
enum Variant {
    Firmware(FirmwareSpec),
    Sdk(SdkSpec),
}

impl Variant {
    fn blocks(&self) -> &BlockWriter {
        match self {
            Variant::Firmware(spec) => &spec.blocks,
            Variant::Sdk(spec) => &spec.blocks,
        }
    }

    fn block_command(&self, offset: usize, seq: usize, block: &[u8]) -> Result<Command, String> {
        let mut payload = Vec::with_capacity(block.len() + 5);
        match self {
            Variant::Firmware(_) => {
                let offset = u32::try_from(offset).map_err(|_| format!("offset {offset} exceeds u32"))?;
                payload.extend_from_slice(&offset.to_be_bytes());
                payload.push(block.len() as u8);
                payload.extend_from_slice(block);
            }
            Variant::Sdk(_) => {
                let seq = u16::try_from(seq).map_err(|_| format!("block sequence {seq} exceeds u16"))?;
                payload.extend_from_slice(&seq.to_be_bytes());
                payload.extend_from_slice(block);
                payload.push(block.iter().fold(0u8, |acc, b| acc ^ b));
            }
        }
        let blocks = self.blocks();
        blocks
            .framer
            .command(blocks.write_id, &payload)
            .map_err(|e| e.to_string())
    }

    fn check_ack(&self, seq: usize, offset: usize, ack: &[u8]) -> Result<(), String> {
        match self {
            Variant::Firmware(_) => match ack.first() {
                None | Some(0) => Ok(()),
                Some(code) => Err(format!("device rejected block at offset {offset} (code {code})")),
            },
            Variant::Sdk(_) => {
                if ack.len() < 2 || BigEndian::read_u16(ack) as usize != seq {
                    return Err(format!("unexpected ack for block {seq}: {ack:02X?}"));
                }
                Ok(())
            }
        }
    }

    fn verify(&self, channel: &dyn Channel, content: &[u8], written: usize) -> Result<(), String> {
        if written != content.len() {
            return Err(format!("wrote {written} of {} bytes", content.len()));
        }
        let Variant::Sdk(spec) = self else {
            return Ok(());
        };

        let mut payload = [0u8; 8];
        BigEndian::write_u32(&mut payload[..4], content.len() as u32);
        BigEndian::write_u32(&mut payload[4..], SDK_IMAGE_CRC.checksum(content));
        let command = spec
            .blocks
            .framer
            .command(spec.finish_id, &payload)
            .map_err(|e| e.to_string())?;
        let ack = channel
            .write_read(&command, spec.finish_timeout)
            .map_err(|e| format!("finish: {e}"))?;
        match ack.payload.first() {
            Some(0) => Ok(()),
            Some(code) => Err(format!("device rejected image (code {code})")),
            None => Err("empty finish ack".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::engine::ExchangeError;
    use crate::events::NullObserver;
    use crate::protocol::{
        CMD_JUMP_BOOTLOADER, CMD_SDK_FINISH, CMD_SDK_WRITE, CMD_SELECT_CORE, CMD_WRITE_APP, MacAddr, PacketLayout,
    };
    use crate::upgrade::channel::testing::ScriptedChannel;

    fn blocks(block_size: usize) -> BlockWriter {
        BlockWriter {
            framer: Framer::ethernet(MacAddr([1; 6]), MacAddr([2; 6])),
            write_id: CMD_WRITE_APP,
            block_size,
            ack_timeout: Duration::from_millis(10),
        }
    }

    fn bare_channel(responder: impl Fn(&[u8; 2], &[u8]) -> Result<Vec<u8>, ExchangeError> + Send + Sync + 'static) -> ScriptedChannel {
        ScriptedChannel::new(PacketLayout::Ethernet, responder)
    }

    #[test]
    fn test_firmware_worker_event_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut worker = UpgradeWorker::firmware(
            "rtk",
            Identity::MainRtk,
            FirmwareSpec { blocks: blocks(192) },
            Box::new(|| vec![0xAB; 400]),
        );
        for event in [
            UpgradeEvent::FirstPacket,
            UpgradeEvent::BeforeWrite,
            UpgradeEvent::Progress,
            UpgradeEvent::AfterWrite,
            UpgradeEvent::Finish,
        ] {
            let log = Arc::clone(&log);
            worker.on(event, move |ctx| {
                log.lock().unwrap().push((event, ctx.current, ctx.total));
                Ok(())
            });
        }

        let channel = ScriptedChannel::acking(PacketLayout::Ethernet);
        worker.run(&channel, &NullObserver).unwrap();
        assert_eq!(worker.state(), WorkerState::Done);

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                (UpgradeEvent::FirstPacket, 192, 400),
                (UpgradeEvent::BeforeWrite, 192, 400),
                (UpgradeEvent::Progress, 192, 400),
                (UpgradeEvent::Progress, 384, 400),
                (UpgradeEvent::Progress, 400, 400),
                (UpgradeEvent::AfterWrite, 400, 400),
                (UpgradeEvent::Finish, 400, 400),
            ]
        );

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let (id, payload, _) = &sent[2];
        assert_eq!(*id, CMD_WRITE_APP);
        assert_eq!(&payload[..4], &384u32.to_be_bytes());
        assert_eq!(payload[4], 16);
        assert_eq!(payload.len(), 5 + 16);
    }

    #[test]
    fn test_single_block_runs_before_write_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut worker = UpgradeWorker::firmware(
            "ins",
            Identity::MainRtk,
            FirmwareSpec { blocks: blocks(192) },
            Box::new(|| vec![0x5A; 16]),
        );
        for event in [
            UpgradeEvent::BeforeWrite,
            UpgradeEvent::FirstPacket,
            UpgradeEvent::Progress,
            UpgradeEvent::AfterWrite,
            UpgradeEvent::Finish,
        ] {
            let log = Arc::clone(&log);
            worker.on(event, move |ctx| {
                if event == UpgradeEvent::BeforeWrite {
                    let framer = Framer::ethernet(MacAddr([1; 6]), MacAddr([2; 6]));
                    ctx.channel.write(&framer.command(CMD_SELECT_CORE, &[0])?)?;
                }
                log.lock().unwrap().push((event, ctx.current, ctx.total));
                Ok(())
            });
        }

        let channel = ScriptedChannel::acking(PacketLayout::Ethernet);
        worker.run(&channel, &NullObserver).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (UpgradeEvent::BeforeWrite, 0, 16),
                (UpgradeEvent::FirstPacket, 16, 16),
                (UpgradeEvent::Progress, 16, 16),
                (UpgradeEvent::AfterWrite, 16, 16),
                (UpgradeEvent::Finish, 16, 16),
            ]
        );
        // The pre-write hook's traffic goes out ahead of the only block.
        assert_eq!(channel.ids(), vec![CMD_SELECT_CORE, CMD_WRITE_APP]);
    }

    #[test]
    fn test_content_is_supplied_lazily() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let mut worker = UpgradeWorker::firmware(
            "imu",
            Identity::SubImu,
            FirmwareSpec { blocks: blocks(64) },
            Box::new(move || {
                *counter.lock().unwrap() += 1;
                vec![1; 64]
            }),
        );
        worker.arm();
        assert_eq!(worker.state(), WorkerState::Armed);
        assert_eq!(*calls.lock().unwrap(), 0);

        worker.run(&ScriptedChannel::acking(PacketLayout::Ethernet), &NullObserver).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_missing_ack_fails_worker() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let mut worker = UpgradeWorker::firmware(
            "rtk",
            Identity::MainRtk,
            FirmwareSpec { blocks: blocks(16) },
            Box::new(|| vec![0; 64]),
        );
        worker.on(UpgradeEvent::Error, move |ctx| {
            seen.lock().unwrap().push(ctx.cause.unwrap_or_default().to_string());
            Ok(())
        });

        let channel = bare_channel(|_, payload| {
            if payload[..4] == 32u32.to_be_bytes() {
                Err(ExchangeError::NoResponse {
                    filter: 0x03AA,
                    elapsed: Duration::from_millis(10),
                })
            } else {
                Ok(Vec::new())
            }
        });
        let err = worker.run(&channel, &NullObserver).unwrap_err();
        assert_eq!(worker.state(), WorkerState::Error);
        assert_eq!(err.state, WorkerState::Writing);
        assert_eq!(err.worker, "rtk(MAIN_RTK)");
        assert!(err.cause.contains("offset 32"));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(channel.ids().len(), 3);
    }

    #[test]
    fn test_rejected_block_and_failing_hook() {
        let mut worker = UpgradeWorker::firmware(
            "rtk",
            Identity::MainRtk,
            FirmwareSpec { blocks: blocks(16) },
            Box::new(|| vec![0; 16]),
        );
        let channel = bare_channel(|_, _| Ok(vec![3]));
        let err = worker.run(&channel, &NullObserver).unwrap_err();
        assert!(err.cause.contains("code 3"));
        assert_eq!(err.state, WorkerState::Armed);

        let mut worker = UpgradeWorker::firmware(
            "ins",
            Identity::MainRtk,
            FirmwareSpec { blocks: blocks(16) },
            Box::new(|| vec![0; 32]),
        );
        worker.on(UpgradeEvent::BeforeWrite, |_| anyhow::bail!("core select refused"));
        let channel = ScriptedChannel::acking(PacketLayout::Ethernet);
        let err = worker.run(&channel, &NullObserver).unwrap_err();
        assert_eq!(err.state, WorkerState::FirstPacketSent);
        assert!(err.cause.contains("before_write"));
        assert_eq!(channel.ids().len(), 1);
    }

    #[test]
    fn test_sdk_worker_sequence_and_finish() {
        let spec = SdkSpec {
            blocks: BlockWriter {
                write_id: CMD_SDK_WRITE,
                ..blocks(10)
            },
            finish_id: CMD_SDK_FINISH,
            finish_timeout: Duration::from_millis(10),
        };
        let content: Vec<u8> = (0..25).collect();
        let expected_crc = SDK_IMAGE_CRC.checksum(&content);
        let supplied = content.clone();
        let mut worker = UpgradeWorker::sdk("sdk", spec, Box::new(move || supplied.clone()));

        let channel = bare_channel(|id, payload| {
            if *id == CMD_SDK_WRITE {
                Ok(payload[..2].to_vec())
            } else {
                Ok(vec![0])
            }
        });
        worker.run(&channel, &NullObserver).unwrap();

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        let (_, last_block, _) = &sent[2];
        assert_eq!(&last_block[..2], &2u16.to_be_bytes());
        assert_eq!(last_block.len(), 2 + 5 + 1);
        assert_eq!(*last_block.last().unwrap(), (20..25).fold(0u8, |a, b| a ^ b));

        let (id, finish, _) = &sent[3];
        assert_eq!(*id, CMD_SDK_FINISH);
        assert_eq!(&finish[..4], &25u32.to_be_bytes());
        assert_eq!(&finish[4..], &expected_crc.to_be_bytes());
    }

    #[test]
    fn test_sdk_wrong_echo_fails() {
        let spec = SdkSpec {
            blocks: blocks(10),
            finish_id: CMD_SDK_FINISH,
            finish_timeout: Duration::from_millis(10),
        };
        let mut worker = UpgradeWorker::sdk("sdk", spec, Box::new(|| vec![0; 20]));
        let channel = bare_channel(|_, _| Ok(vec![0, 9]));
        let err = worker.run(&channel, &NullObserver).unwrap_err();
        assert!(err.cause.contains("unexpected ack"));
    }

    #[test]
    fn test_jump_worker_goes_straight_to_done() {
        let framer = Framer::ethernet(MacAddr([1; 6]), MacAddr([2; 6]));
        let spec = JumpSpec {
            command: framer.command(CMD_JUMP_BOOTLOADER, &[]).unwrap(),
            delivery: Delivery::Raw,
            settle: Duration::ZERO,
        };
        let mut worker = UpgradeWorker::jump_bootloader(Identity::MainRtk, spec);
        assert!(worker.is_jump());
        assert!(!worker.is_firmware());

        let channel = ScriptedChannel::acking(PacketLayout::Ethernet);
        worker.run(&channel, &NullObserver).unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
        assert_eq!(*channel.sent.lock().unwrap(), vec![(CMD_JUMP_BOOTLOADER, vec![], false)]);

        assert!(worker.run(&channel, &NullObserver).is_err());
    }

    #[test]
    fn test_oversized_block_is_rejected_up_front() {
        let mut worker = UpgradeWorker::firmware(
            "rtk",
            Identity::MainRtk,
            FirmwareSpec { blocks: blocks(300) },
            Box::new(|| vec![0; 10]),
        );
        let channel = ScriptedChannel::acking(PacketLayout::Ethernet);
        assert!(worker.run(&channel, &NullObserver).is_err());
        assert!(channel.ids().is_empty());
    }
}
