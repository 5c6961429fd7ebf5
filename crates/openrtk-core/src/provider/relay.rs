//! Consumers hanging off the read path: NMEA assembly feeding the RTCM
//! correction relay.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::protocol::NmeaAssembler;

/// How often the consumer checks for a stop request while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Counters {
    sentences: AtomicU64,
    gga: AtomicU64,
    malformed: AtomicU64,
}

/// Totals of a relay's life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NmeaStats {
    pub sentences: u64,
    pub gga: u64,
    pub malformed: u64,
}

/// Background task turning raw reads into NMEA sentences. Valid sentences are
/// logged; `$GPGGA` ones are also sent to the correction relay sink.
pub struct NmeaRelay {
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl NmeaRelay {
    pub fn spawn(raw: Receiver<Vec<u8>>, gga_sink: Option<Sender<String>>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let handle = {
            let stop = Arc::clone(&stop);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("openrtk-nmea".into())
                .spawn(move || consume(raw, gga_sink, &stop, &counters))?
        };
        Ok(Self {
            stop,
            counters,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> NmeaStats {
        NmeaStats {
            sentences: self.counters.sentences.load(Ordering::Relaxed),
            gga: self.counters.gga.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }

    /// Stop the consumer and wait for it.
    pub fn stop(mut self) -> NmeaStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            debug!("NMEA consumer panicked");
        }
    }
}

impl Drop for NmeaRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consume(raw: Receiver<Vec<u8>>, mut gga_sink: Option<Sender<String>>, stop: &AtomicBool, counters: &Counters) {
    let mut assembler = NmeaAssembler::new();
    info!("NMEA consumer started");

    while !stop.load(Ordering::SeqCst) {
        let data = match raw.recv_timeout(POLL_INTERVAL) {
            Ok(data) => data,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        for sentence in assembler.push(&data) {
            counters.sentences.fetch_add(1, Ordering::Relaxed);
            trace!(nmea = sentence.text(), "NMEA");
            if !sentence.is_gga() {
                continue;
            }
            counters.gga.fetch_add(1, Ordering::Relaxed);
            if let Some(sink) = &gga_sink
                && sink.send(sentence.line()).is_err()
            {
                debug!("GGA sink closed");
                gga_sink = None;
            }
        }
        counters.malformed.store(assembler.malformed(), Ordering::Relaxed);
    }

    info!("NMEA consumer stopped");
}
