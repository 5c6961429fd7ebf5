//! Device-facing orchestration: binds a communicator, the message center and
//! the upgrade pipeline into the commands a front-end issues.

pub mod config;
pub mod device_info;
pub mod params;
pub mod profile;
pub mod relay;
pub mod response;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub use config::{DeviceProperties, InitialSettings, ParamSetting, ProviderConfig, UserMessages};
pub use device_info::{AppInfo, DeviceInfo};
pub use params::ParamValue;
pub use profile::{DeviceProfile, EthernetProfile, UartProfile};
pub use relay::{NmeaRelay, NmeaStats};
pub use response::{CommandResponse, PacketType};

use crate::engine::{MessageCenter, lock};
use crate::events::{RtkEvent, RtkObserver, RtkPhase, TracingObserver};
use crate::payload::FirmwareImage;
use crate::protocol::{CMD_RTCM_FORWARD, FrameError, Framer, Packet, PacketLayout};
use crate::transport::{Communicator, TransportError};
use crate::upgrade::{Pipeline, WorkerError};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Malformed device info: {0}")]
    MalformedDeviceInfo(String),

    #[error("An upgrade is already running")]
    UpgradeInProgress,

    #[error("Upgrade thread panicked")]
    UpgradeThreadPanicked,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type UpgradeHandle = JoinHandle<Result<(), WorkerError>>;

/// Device provider over one communicator.
pub struct Provider<C: Communicator + 'static> {
    center: MessageCenter<C>,
    framer: Framer,
    config: ProviderConfig,
    properties: DeviceProperties,
    profile: Arc<dyn DeviceProfile>,
    observer: Arc<dyn RtkObserver>,
    device: Mutex<Option<(DeviceInfo, AppInfo)>>,
    upgrading: Arc<AtomicBool>,
    upgrade: Mutex<Option<UpgradeHandle>>,
    nmea: Arc<Mutex<Option<NmeaRelay>>>,
    gga_sink: Mutex<Option<Sender<String>>>,
}

impl<C: Communicator + 'static> Provider<C> {
    /// Provider with the profile matching the communicator's layout.
    pub fn new(comm: Arc<C>, config: ProviderConfig, properties: DeviceProperties) -> Self {
        Self::with_observer(comm, config, properties, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        comm: Arc<C>,
        config: ProviderConfig,
        properties: DeviceProperties,
        observer: Arc<dyn RtkObserver>,
    ) -> Self {
        let framer = comm.framer();
        let profile: Arc<dyn DeviceProfile> = match framer.layout() {
            PacketLayout::Ethernet => Arc::new(EthernetProfile::new(framer, config.clone())),
            PacketLayout::Uart => Arc::new(UartProfile::new(framer, config.clone())),
        };
        Self::with_profile(comm, config, properties, profile, observer)
    }

    pub fn with_profile(
        comm: Arc<C>,
        config: ProviderConfig,
        properties: DeviceProperties,
        profile: Arc<dyn DeviceProfile>,
        observer: Arc<dyn RtkObserver>,
    ) -> Self {
        let center = MessageCenter::with_policy(comm, config.pause_policy);
        info!(profile = profile.name(), "Provider created");
        Self {
            center,
            framer: profile.framer(),
            config,
            properties,
            profile,
            observer,
            device: Mutex::new(None),
            upgrading: Arc::new(AtomicBool::new(false)),
            upgrade: Mutex::new(None),
            nmea: Arc::new(Mutex::new(None)),
            gga_sink: Mutex::new(None),
        }
    }

    pub fn center(&self) -> &MessageCenter<C> {
        &self.center
    }

    pub fn framer(&self) -> Framer {
        self.framer
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub fn profile(&self) -> &dyn DeviceProfile {
        self.profile.as_ref()
    }

    /// Start the background reader.
    pub fn start(&self) -> Result<(), ProviderError> {
        self.center.start()?;
        Ok(())
    }

    /// Stop consumers and the reader. A running upgrade is left to finish.
    pub fn close(&self) {
        if let Some(relay) = lock(&self.nmea).take() {
            let stats = relay.stop();
            debug!(?stats, "NMEA relay stopped");
        }
        self.center.stop();
    }

    /// Record the identification strings the device reported.
    pub fn bind_device_info(&self, device_info: &str, app_info: &str) -> Result<String, ProviderError> {
        let device = DeviceInfo::parse(device_info)?;
        let app = AppInfo::parse(app_info);
        if !app.matched {
            warn!(
                reported = %app.version,
                known = ?device_info::KNOWN_APPS,
                fallback = device_info::FALLBACK_APP,
                "Unrecognised application, using fallback configuration"
            );
        }
        info!(device = %device.name, sn = %device.sn, app = %app.app_name, "Device bound");
        *lock(&self.device) = Some((device, app));
        Ok(format!(
            "# Connected {} #\n\rDevice: {} \n\rFirmware: {}",
            self.profile.name(),
            device_info,
            app_info
        ))
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        lock(&self.device).as_ref().map(|(d, _)| d.clone())
    }

    pub fn app_info(&self) -> Option<AppInfo> {
        lock(&self.device).as_ref().map(|(_, a)| a.clone())
    }

    pub fn is_in_bootloader(&self) -> bool {
        lock(&self.device)
            .as_ref()
            .is_some_and(|(_, app)| app.is_bootloader())
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::SeqCst)
    }

    /// Packets no exchange claimed, e.g. periodic output messages.
    pub fn subscribe_output(&self) -> Receiver<Packet> {
        self.center.subscribe_output()
    }

    /// Assemble NMEA from the read path and hand `$GPGGA` sentences to
    /// `gga_sink`. Replaces a running relay.
    pub fn start_nmea_relay(&self, gga_sink: Option<Sender<String>>) -> Result<(), ProviderError> {
        let relay = NmeaRelay::spawn(self.center.subscribe_raw(), gga_sink.clone())?;
        *lock(&self.gga_sink) = gga_sink;
        if let Some(old) = lock(&self.nmea).replace(relay) {
            old.stop();
        }
        Ok(())
    }

    /// Frame correction data from the relay and write it to the device.
    /// Dropped while an upgrade owns the link or the link cannot write.
    pub fn forward_rtcm(&self, data: &[u8]) -> bool {
        if !self.center.communicator().can_write() || self.is_upgrading() {
            debug!(len = data.len(), "RTCM dropped");
            return false;
        }
        let command = match self.framer.command(CMD_RTCM_FORWARD, data) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "RTCM not framed");
                return false;
            }
        };
        match self.center.write(&command) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "RTCM write failed");
                false
            }
        }
    }

    /// Front-end entry: upgrade from a combined image file.
    pub fn upgrade_framework(&self, file: impl AsRef<Path>) -> CommandResponse {
        let file = file.as_ref();
        let outcome = std::fs::read(file)
            .map_err(ProviderError::from)
            .and_then(|data| self.start_upgrade(data));
        match outcome {
            Ok(()) => {
                info!(file = %file.display(), "Upgrade started");
                CommandResponse::success(json!(null))
            }
            Err(e) => CommandResponse::error(json!({ "error": e.to_string() })),
        }
    }

    /// Run the upgrade for `image` on a dedicated thread.
    ///
    /// Command traffic is paused and output consumers are detached for the
    /// duration. However the run ends, the center resumes and the consumers
    /// that were attached before come back.
    #[instrument(skip_all, fields(len = image.len()))]
    pub fn start_upgrade(&self, image: Vec<u8>) -> Result<(), ProviderError> {
        if self.upgrading.swap(true, Ordering::SeqCst) {
            return Err(ProviderError::UpgradeInProgress);
        }

        self.center.pause();
        let output = self.center.detach_output();
        let relay_sink = lock(&self.nmea).take().map(|relay| {
            relay.stop();
            lock(&self.gga_sink).clone()
        });

        let center = self.center.clone();
        let profile = Arc::clone(&self.profile);
        let observer = Arc::clone(&self.observer);
        let upgrading = Arc::clone(&self.upgrading);
        let rules = self.config.split_rules.clone();
        let nmea = Arc::clone(&self.nmea);

        let spawned = thread::Builder::new()
            .name("openrtk-upgrade".into())
            .spawn(move || {
                observer.on_event(&RtkEvent::PhaseChanged {
                    from: RtkPhase::Idle,
                    to: RtkPhase::Upgrading,
                });
                let image = FirmwareImage::parse(image, &rules);
                let mut pipeline = Pipeline::assemble(&image, profile.as_ref());
                let result = pipeline.run(&center, observer.as_ref());

                center.resume();
                restore_consumers(&center, output, relay_sink, &nmea);
                upgrading.store(false, Ordering::SeqCst);
                let to = match &result {
                    Ok(()) => RtkPhase::Complete,
                    Err(e) => {
                        error!(worker = %e.worker, cause = %e.cause, "Upgrade aborted");
                        RtkPhase::Error
                    }
                };
                observer.on_event(&RtkEvent::PhaseChanged {
                    from: RtkPhase::Upgrading,
                    to,
                });
                result
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.upgrade) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.center.resume();
                self.upgrading.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Wait for the last started upgrade. `None` if none was started.
    pub fn wait_upgrade(&self) -> Option<Result<(), ProviderError>> {
        let handle = lock(&self.upgrade).take()?;
        Some(match handle.join() {
            Ok(result) => result.map_err(ProviderError::from),
            Err(_) => {
                self.center.resume();
                self.upgrading.store(false, Ordering::SeqCst);
                Err(ProviderError::UpgradeThreadPanicked)
            }
        })
    }
}

impl<C: Communicator + 'static> Drop for Provider<C> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.upgrade).take()
            && handle.join().is_err()
        {
            warn!("Upgrade thread panicked");
        }
        self.close();
    }
}

/// Bring back the output subscriber and the NMEA relay an upgrade detached.
fn restore_consumers<C: Communicator + 'static>(
    center: &MessageCenter<C>,
    output: Option<Sender<Packet>>,
    relay_sink: Option<Option<Sender<String>>>,
    nmea: &Mutex<Option<NmeaRelay>>,
) {
    if let Some(tx) = output {
        center.reattach_output(tx);
    }
    let Some(gga_sink) = relay_sink else {
        return;
    };
    match NmeaRelay::spawn(center.subscribe_raw(), gga_sink) {
        Ok(relay) => {
            if let Some(old) = lock(nmea).replace(relay) {
                old.stop();
            }
            debug!("NMEA relay restarted");
        }
        Err(e) => warn!(error = %e, "NMEA relay not restarted"),
    }
}
