//! Upgrade pipeline assembly and execution.
//!
//! Assembly happens in two passes. First every non-empty segment becomes a
//! worker, in rule order. Then, per physical core, one bootloader jump is
//! inserted before the first firmware worker for that core and one application
//! jump after the last, so the mode switch surrounds every write to the core
//! no matter how the segments interleave.

use tracing::{debug, info, instrument};

use super::channel::Channel;
use super::worker::{ContentSupplier, Identity, UpgradeWorker, WorkerError, WorkerGroup};
use crate::events::{RtkEvent, RtkObserver};
use crate::payload::FirmwareImage;

/// Device capability the assembler is parameterized by.
pub trait WorkerFactory {
    /// Worker for one segment; `None` when the device has no use for the tag.
    fn build_worker(&self, tag: &str, content: ContentSupplier) -> Option<UpgradeWorker>;

    fn jump_bootloader(&self, identity: Identity) -> Option<UpgradeWorker>;

    fn jump_application(&self, identity: Identity) -> Option<UpgradeWorker>;
}

/// Cores bracketed, in this order.
const BRACKETED: [Identity; 2] = [Identity::MainRtk, Identity::SubImu];

/// Ordered, bracketed workers for one run.
#[derive(Debug, Default)]
pub struct Pipeline {
    workers: Vec<UpgradeWorker>,
}

impl Pipeline {
    /// Build the pipeline for `image`. Empty segments produce nothing.
    #[instrument(skip_all, fields(image_len = image.len()))]
    pub fn assemble<F: WorkerFactory + ?Sized>(image: &FirmwareImage, factory: &F) -> Self {
        let mut workers = Vec::new();
        for segment in image.segments() {
            if segment.is_empty() {
                debug!(segment = %segment.name, "Empty segment skipped");
                continue;
            }
            match factory.build_worker(&segment.name, Box::new(image.supplier(segment))) {
                Some(worker) => workers.push(worker),
                None => debug!(segment = %segment.name, "No worker for segment"),
            }
        }

        let mut pipeline = Self::from_workers(workers);
        for identity in BRACKETED {
            pipeline.bracket(identity, factory);
        }
        info!(workers = pipeline.len(), "Pipeline assembled");
        pipeline
    }

    /// Wrap already built workers, arming each.
    pub fn from_workers(mut workers: Vec<UpgradeWorker>) -> Self {
        for worker in &mut workers {
            worker.arm();
        }
        Self { workers }
    }

    /// Surround every firmware worker of `identity` with one jump pair.
    ///
    /// The run may be non-contiguous; everything between the first and last
    /// occurrence ends up inside the bracket.
    pub fn bracket<F: WorkerFactory + ?Sized>(&mut self, identity: Identity, factory: &F) {
        let mut span: Option<(usize, usize)> = None;
        for (i, worker) in self.workers.iter().enumerate() {
            if worker.is_firmware() && worker.identity() == Some(identity) {
                span = Some(span.map_or((i, i), |(start, _)| (start, i)));
            }
        }
        let Some((start, end)) = span else {
            return;
        };

        let shift = match factory.jump_bootloader(identity) {
            Some(mut jump) => {
                jump.arm();
                self.workers.insert(start, jump);
                1
            }
            None => 0,
        };
        if let Some(mut jump) = factory.jump_application(identity) {
            jump.arm();
            let after = (end + 1 + shift).min(self.workers.len());
            self.workers.insert(after, jump);
        }
        debug!(identity = %identity, start, end, "Bracketed");
    }

    pub fn workers(&self) -> &[UpgradeWorker] {
        &self.workers
    }

    /// Worker names in list order.
    pub fn names(&self) -> Vec<String> {
        self.workers.iter().map(UpgradeWorker::name).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Execution order: `BeforeAll`, then `Firmware` in list order, then
    /// `AfterAll`.
    fn execution_order(&self) -> Vec<usize> {
        [WorkerGroup::BeforeAll, WorkerGroup::Firmware, WorkerGroup::AfterAll]
            .into_iter()
            .flat_map(|group| {
                self.workers
                    .iter()
                    .enumerate()
                    .filter(move |(_, w)| w.group() == group)
                    .map(|(i, _)| i)
            })
            .collect()
    }

    /// Run every worker; the first failure ends the run.
    #[instrument(skip_all, fields(workers = self.workers.len()))]
    pub fn run(&mut self, channel: &dyn Channel, observer: &dyn RtkObserver) -> Result<(), WorkerError> {
        let order = self.execution_order();
        let total = order.len();
        observer.on_event(&RtkEvent::UpgradeStarted { workers: total });

        for (step, index) in order.into_iter().enumerate() {
            let worker = &mut self.workers[index];
            let name = worker.name();
            observer.on_event(&RtkEvent::WorkerStarted {
                index: step,
                total,
                worker: name.clone(),
            });

            if let Err(e) = worker.run(channel, observer) {
                observer.on_event(&RtkEvent::WorkerFailed {
                    worker: name,
                    message: e.cause.clone(),
                });
                return Err(e);
            }
            observer.on_event(&RtkEvent::WorkerFinished { worker: name });
        }

        observer.on_event(&RtkEvent::Complete);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;
    use crate::payload::default_rules;
    use crate::protocol::{
        CMD_IMU_JUMP_APPLICATION, CMD_IMU_JUMP_BOOTLOADER, CMD_JUMP_APPLICATION, CMD_JUMP_BOOTLOADER,
        CMD_SDK_FINISH, CMD_SDK_WRITE, CMD_WRITE_APP, CommandId, Framer, MacAddr, PacketLayout,
    };
    use crate::upgrade::channel::testing::ScriptedChannel;
    use crate::upgrade::worker::{BlockWriter, Delivery, FirmwareSpec, JumpSpec, SdkSpec, WorkerState};

    struct TestFactory {
        framer: Framer,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                framer: Framer::ethernet(MacAddr([1; 6]), MacAddr([2; 6])),
            }
        }

        fn blocks(&self, write_id: CommandId) -> BlockWriter {
            BlockWriter {
                framer: self.framer,
                write_id,
                block_size: 32,
                ack_timeout: Duration::from_millis(10),
            }
        }

        fn jump(&self, id: CommandId) -> JumpSpec {
            JumpSpec {
                command: self.framer.bare(id, &[]).unwrap(),
                delivery: Delivery::Raw,
                settle: Duration::ZERO,
            }
        }
    }

    impl WorkerFactory for TestFactory {
        fn build_worker(&self, tag: &str, content: ContentSupplier) -> Option<UpgradeWorker> {
            let firmware = FirmwareSpec {
                blocks: self.blocks(CMD_WRITE_APP),
            };
            match tag {
                "rtk" | "ins" => Some(UpgradeWorker::firmware(tag, Identity::MainRtk, firmware, content)),
                "imu" => Some(UpgradeWorker::firmware(tag, Identity::SubImu, firmware, content)),
                "sdk" => Some(UpgradeWorker::sdk(
                    tag,
                    SdkSpec {
                        blocks: self.blocks(CMD_SDK_WRITE),
                        finish_id: CMD_SDK_FINISH,
                        finish_timeout: Duration::from_millis(10),
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
            Some(UpgradeWorker::jump_bootloader(identity, self.jump(id)))
        }

        fn jump_application(&self, identity: Identity) -> Option<UpgradeWorker> {
            let id = match identity {
                Identity::MainRtk => CMD_JUMP_APPLICATION,
                Identity::SubImu => CMD_IMU_JUMP_APPLICATION,
            };
            Some(UpgradeWorker::jump_application(identity, self.jump(id)))
        }
    }

    fn image(sections: &[(&str, usize)]) -> FirmwareImage {
        let mut data = Vec::new();
        for (marker, size) in sections {
            data.extend_from_slice(marker.as_bytes());
            data.extend_from_slice(&(*size as u32).to_le_bytes());
            data.extend(std::iter::repeat_n(0x5A, *size));
        }
        FirmwareImage::parse(data, &default_rules())
    }

    fn sdk_ack(id: &[u8; 2], payload: &[u8]) -> Result<Vec<u8>, crate::engine::ExchangeError> {
        Ok(match *id {
            CMD_SDK_WRITE => payload[..2].to_vec(),
            CMD_SDK_FINISH => vec![0],
            _ => Vec::new(),
        })
    }

    #[test]
    fn test_end_to_end_assembly_with_absent_segment() {
        let fw = image(&[("rtk_start:", 100), ("ins_start:", 0), ("imu_start:", 50)]);
        let pipeline = Pipeline::assemble(&fw, &TestFactory::new());
        assert_eq!(
            pipeline.names(),
            vec![
                "jump_bootloader(MAIN_RTK)",
                "rtk(MAIN_RTK)",
                "jump_application(MAIN_RTK)",
                "jump_bootloader(SUB_IMU)",
                "imu(SUB_IMU)",
                "jump_application(SUB_IMU)",
            ]
        );
        assert!(pipeline.workers().iter().all(|w| w.state() == WorkerState::Armed));
    }

    #[test]
    fn test_single_bracket_around_shared_core() {
        let fw = image(&[("rtk_start:", 40), ("ins_start:", 40)]);
        let pipeline = Pipeline::assemble(&fw, &TestFactory::new());
        assert_eq!(
            pipeline.names(),
            vec![
                "jump_bootloader(MAIN_RTK)",
                "rtk(MAIN_RTK)",
                "ins(MAIN_RTK)",
                "jump_application(MAIN_RTK)",
            ]
        );
    }

    #[test]
    fn test_non_contiguous_run_is_bracketed_once() {
        let fw = image(&[("rtk_start:", 40), ("sdk_start:", 40), ("ins_start:", 40)]);
        let pipeline = Pipeline::assemble(&fw, &TestFactory::new());
        // Rule order puts ins before sdk; the image order does not matter.
        assert_eq!(
            pipeline.names(),
            vec![
                "jump_bootloader(MAIN_RTK)",
                "rtk(MAIN_RTK)",
                "ins(MAIN_RTK)",
                "jump_application(MAIN_RTK)",
                "sdk",
            ]
        );

        let factory = TestFactory::new();
        let supply = || -> ContentSupplier { Box::new(|| vec![0; 32]) };
        let mut pipeline = Pipeline::from_workers(vec![
            factory.build_worker("rtk", supply()).unwrap(),
            factory.build_worker("sdk", supply()).unwrap(),
            factory.build_worker("ins", supply()).unwrap(),
        ]);
        pipeline.bracket(Identity::MainRtk, &factory);
        assert_eq!(
            pipeline.names(),
            vec![
                "jump_bootloader(MAIN_RTK)",
                "rtk(MAIN_RTK)",
                "sdk",
                "ins(MAIN_RTK)",
                "jump_application(MAIN_RTK)",
            ]
        );
    }

    #[test]
    fn test_nested_identities_bracket_independently() {
        let fw = image(&[("rtk_start:", 40), ("ins_start:", 40), ("imu_start:", 40)]);
        let factory = TestFactory::new();
        let supply = || -> ContentSupplier { Box::new(|| vec![0; 32]) };
        let mut pipeline = Pipeline::from_workers(vec![
            factory.build_worker("rtk", supply()).unwrap(),
            factory.build_worker("imu", supply()).unwrap(),
            factory.build_worker("ins", supply()).unwrap(),
        ]);
        for identity in BRACKETED {
            pipeline.bracket(identity, &factory);
        }
        assert_eq!(
            pipeline.names(),
            vec![
                "jump_bootloader(MAIN_RTK)",
                "rtk(MAIN_RTK)",
                "jump_bootloader(SUB_IMU)",
                "imu(SUB_IMU)",
                "jump_application(SUB_IMU)",
                "ins(MAIN_RTK)",
                "jump_application(MAIN_RTK)",
            ]
        );

        // Length equals non-empty segments plus the brackets inserted.
        assert_eq!(Pipeline::assemble(&fw, &factory).len(), 3 + 4);
    }

    /// Profile whose device needs no entry jump, only the exit one.
    struct ExitJumpOnly(TestFactory);

    impl WorkerFactory for ExitJumpOnly {
        fn build_worker(&self, tag: &str, content: ContentSupplier) -> Option<UpgradeWorker> {
            self.0.build_worker(tag, content)
        }

        fn jump_bootloader(&self, _identity: Identity) -> Option<UpgradeWorker> {
            None
        }

        fn jump_application(&self, identity: Identity) -> Option<UpgradeWorker> {
            self.0.jump_application(identity)
        }
    }

    #[test]
    fn test_exit_jump_follows_last_firmware_without_entry_jump() {
        let factory = ExitJumpOnly(TestFactory::new());
        let supply = || -> ContentSupplier { Box::new(|| vec![0; 32]) };
        let mut pipeline = Pipeline::from_workers(vec![
            factory.build_worker("rtk", supply()).unwrap(),
            factory.build_worker("ins", supply()).unwrap(),
            factory.build_worker("sdk", supply()).unwrap(),
        ]);
        pipeline.bracket(Identity::MainRtk, &factory);
        assert_eq!(
            pipeline.names(),
            vec!["rtk(MAIN_RTK)", "ins(MAIN_RTK)", "jump_application(MAIN_RTK)", "sdk"]
        );
    }

    #[test]
    fn test_empty_image_yields_empty_pipeline() {
        let fw = image(&[("rtk_start:", 0), ("sdk_start:", 0)]);
        let pipeline = Pipeline::assemble(&fw, &TestFactory::new());
        assert!(pipeline.is_empty());

        let fw = image(&[("sdk_start:", 64)]);
        assert_eq!(Pipeline::assemble(&fw, &TestFactory::new()).names(), vec!["sdk"]);
    }

    #[test]
    fn test_run_in_order_and_report() {
        let fw = image(&[("rtk_start:", 40), ("sdk_start:", 20), ("imu_start:", 10)]);
        let mut pipeline = Pipeline::assemble(&fw, &TestFactory::new());
        let channel = ScriptedChannel::new(PacketLayout::Ethernet, sdk_ack);
        let observer = RecordingObserver::default();

        pipeline.run(&channel, &observer).unwrap();
        assert!(pipeline.workers().iter().all(|w| w.state() == WorkerState::Done));

        // rtk pads to 48 bytes: two 32-byte blocks.
        assert_eq!(
            channel.ids(),
            vec![
                CMD_JUMP_BOOTLOADER,
                CMD_WRITE_APP,
                CMD_WRITE_APP,
                CMD_JUMP_APPLICATION,
                CMD_SDK_WRITE,
                CMD_SDK_FINISH,
                CMD_IMU_JUMP_BOOTLOADER,
                CMD_WRITE_APP,
                CMD_IMU_JUMP_APPLICATION,
            ]
        );
        let events = observer.events.lock().unwrap();
        assert!(matches!(events.first(), Some(RtkEvent::UpgradeStarted { workers: 7 })));
        assert!(matches!(events.last(), Some(RtkEvent::Complete)));
    }

    #[test]
    fn test_first_failure_aborts_run() {
        let fw = image(&[("rtk_start:", 40), ("imu_start:", 10)]);
        let mut pipeline = Pipeline::assemble(&fw, &TestFactory::new());
        let channel = ScriptedChannel::new(PacketLayout::Ethernet, |_, _| Ok(vec![1]));

        let err = pipeline.run(&channel, &NullObserver).unwrap_err();
        assert_eq!(err.worker, "rtk(MAIN_RTK)");
        let states: Vec<_> = pipeline.workers().iter().map(UpgradeWorker::state).collect();
        assert_eq!(states[0], WorkerState::Done);
        assert_eq!(states[1], WorkerState::Error);
        assert!(states[2..].iter().all(|s| *s == WorkerState::Armed));
        assert_eq!(channel.ids(), vec![CMD_JUMP_BOOTLOADER, CMD_WRITE_APP]);
    }

    #[test]
    fn test_groups_run_outside_list_order() {
        let factory = TestFactory::new();
        let supply = || -> ContentSupplier { Box::new(|| vec![0; 16]) };
        let last = factory
            .jump_application(Identity::MainRtk)
            .unwrap()
            .with_group(WorkerGroup::AfterAll);
        let first = factory
            .jump_bootloader(Identity::MainRtk)
            .unwrap()
            .with_group(WorkerGroup::BeforeAll);
        let mut pipeline = Pipeline::from_workers(vec![
            last,
            factory.build_worker("rtk", supply()).unwrap(),
            first,
        ]);
        let channel = ScriptedChannel::acking(PacketLayout::Ethernet);
        pipeline.run(&channel, &NullObserver).unwrap();
        assert_eq!(
            channel.ids(),
            vec![CMD_JUMP_BOOTLOADER, CMD_WRITE_APP, CMD_JUMP_APPLICATION]
        );
    }
}
