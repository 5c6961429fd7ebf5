//! The message center: one in-flight command per communicator.
//!
//! Callers hand `build()` a framed command and block until the response with
//! the matching filter arrives or the timeout elapses. A background reader
//! pushes raw bytes into `dispatch()`, which attributes decoded packets to the
//! pending exchange and forwards everything else to subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use super::exchange::{ExchangeError, ExchangeResult, PausePolicy};
use crate::protocol::{Command, Framer, Packet, PacketDecoder};
use crate::transport::{Communicator, TransportError};

/// Largest read requested from the communicator in one go.
const READ_CHUNK: usize = 4096;
/// Pause after a failed read before retrying.
const READ_BACKOFF: Duration = Duration::from_millis(20);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Pending {
    filter: u16,
    /// Owned by a bulk transfer; still matched while paused.
    bulk: bool,
    response: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct CenterState {
    paused: bool,
    /// An exchange holds the slot, from admission until its result is taken.
    busy: bool,
    pending: Option<Pending>,
}

struct Inner<C> {
    comm: Arc<C>,
    policy: PausePolicy,
    state: Mutex<CenterState>,
    cond: Condvar,
    decoder: Mutex<PacketDecoder>,
    output: Mutex<Option<Sender<Packet>>>,
    raw: Mutex<Option<Sender<Vec<u8>>>>,
    running: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Request/response arbiter over a single communicator. Cloning yields another
/// handle to the same center.
pub struct MessageCenter<C: Communicator> {
    inner: Arc<Inner<C>>,
}

impl<C: Communicator> Clone for MessageCenter<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Communicator + 'static> MessageCenter<C> {
    pub fn new(comm: Arc<C>) -> Self {
        Self::with_policy(comm, PausePolicy::default())
    }

    pub fn with_policy(comm: Arc<C>, policy: PausePolicy) -> Self {
        let layout = comm.layout();
        Self {
            inner: Arc::new(Inner {
                comm,
                policy,
                state: Mutex::new(CenterState::default()),
                cond: Condvar::new(),
                decoder: Mutex::new(PacketDecoder::new(layout)),
                output: Mutex::new(None),
                raw: Mutex::new(None),
                running: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn communicator(&self) -> &Arc<C> {
        &self.inner.comm
    }

    pub fn framer(&self) -> Framer {
        self.inner.comm.framer()
    }

    pub fn policy(&self) -> PausePolicy {
        self.inner.policy
    }

    /// Receive packets that matched no pending exchange. Replaces any earlier
    /// subscriber.
    pub fn subscribe_output(&self) -> Receiver<Packet> {
        let (tx, rx) = mpsc::channel();
        *lock(&self.inner.output) = Some(tx);
        rx
    }

    /// Take the output subscriber out; nothing is forwarded until one is
    /// attached again.
    pub fn detach_output(&self) -> Option<Sender<Packet>> {
        lock(&self.inner.output).take()
    }

    /// Put back a detached subscriber unless a new one subscribed meanwhile.
    pub fn reattach_output(&self, tx: Sender<Packet>) {
        let mut slot = lock(&self.inner.output);
        if slot.is_none() {
            *slot = Some(tx);
        }
    }

    /// Receive every raw chunk read from the communicator. Replaces any
    /// earlier subscriber.
    pub fn subscribe_raw(&self) -> Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        *lock(&self.inner.raw) = Some(tx);
        rx
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.inner.state).paused
    }

    /// Stop admitting `build()` calls and stop attributing frames to them.
    pub fn pause(&self) {
        let mut state = lock(&self.inner.state);
        if !state.paused {
            state.paused = true;
            info!(in_flight = state.busy, "Message center paused");
        }
    }

    pub fn resume(&self) {
        let mut state = lock(&self.inner.state);
        if state.paused {
            state.paused = false;
            info!("Message center resumed");
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Send `command` and wait for the response carrying its filter.
    pub fn build(&self, command: &Command, timeout: Duration) -> Result<ExchangeResult, ExchangeError> {
        self.exchange(command, command.filter(), timeout, false)
    }

    /// Like [`build`](Self::build) with an explicit response filter.
    pub fn build_with_filter(
        &self,
        command: &Command,
        filter: u16,
        timeout: Duration,
    ) -> Result<ExchangeResult, ExchangeError> {
        self.exchange(command, filter, timeout, false)
    }

    /// Exchange on behalf of a bulk transfer. Admitted and matched while
    /// paused; still serialized with every other exchange.
    pub fn write_read(&self, command: &Command, timeout: Duration) -> Result<ExchangeResult, ExchangeError> {
        self.exchange(command, command.filter(), timeout, true)
    }

    /// Write without waiting for anything.
    pub fn write(&self, command: &Command) -> Result<(), ExchangeError> {
        self.inner
            .comm
            .write(command.bytes())
            .map(|_| ())
            .map_err(|e| ExchangeError::WriteRejected {
                filter: command.filter(),
                reason: e.to_string(),
            })
    }

    fn admit(&self, filter: u16, timeout: Duration, bulk: bool) -> Result<(), ExchangeError> {
        let inner = &self.inner;
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = lock(&inner.state);

        loop {
            let blocked_by_pause = state.paused && !bulk;
            if blocked_by_pause && inner.policy == PausePolicy::Reject {
                return Err(ExchangeError::Paused);
            }
            if !blocked_by_pause && !state.busy {
                break;
            }
            if blocked_by_pause {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ExchangeError::NoResponse {
                        filter,
                        elapsed: start.elapsed(),
                    });
                }
                state = inner
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            } else {
                state = inner.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        }

        state.busy = true;
        state.pending = Some(Pending {
            filter,
            bulk,
            response: None,
        });
        Ok(())
    }

    fn release(&self) {
        let mut state = lock(&self.inner.state);
        state.busy = false;
        state.pending = None;
        drop(state);
        self.inner.cond.notify_all();
    }

    fn exchange(
        &self,
        command: &Command,
        filter: u16,
        timeout: Duration,
        bulk: bool,
    ) -> Result<ExchangeResult, ExchangeError> {
        self.admit(filter, timeout, bulk)?;

        let sent = Instant::now();
        if let Err(e) = self.inner.comm.write(command.bytes()) {
            self.release();
            warn!(filter = %format!("{filter:#06x}"), error = %e, "Write rejected");
            return Err(ExchangeError::WriteRejected {
                filter,
                reason: e.to_string(),
            });
        }
        trace!(filter = %format!("{filter:#06x}"), len = command.len(), bulk, "Command written");

        let deadline = sent + timeout;
        let mut state = lock(&self.inner.state);
        let response = loop {
            if let Some(payload) = state.pending.as_mut().and_then(|p| p.response.take()) {
                break Some(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        drop(state);
        self.release();

        let elapsed = sent.elapsed();
        match response {
            Some(payload) => {
                debug!(
                    filter = %format!("{filter:#06x}"),
                    len = payload.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Response matched"
                );
                Ok(ExchangeResult {
                    filter,
                    payload,
                    elapsed,
                })
            }
            None => {
                warn!(
                    filter = %format!("{filter:#06x}"),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "No response"
                );
                Err(ExchangeError::NoResponse { filter, elapsed })
            }
        }
    }

    /// Feed raw bytes read from the communicator.
    pub fn dispatch(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.forward_raw(data);

        let packets = lock(&self.inner.decoder).push(data);
        for packet in packets {
            let unmatched = {
                let mut state = lock(&self.inner.state);
                let paused = state.paused;
                match state.pending.as_mut() {
                    Some(p)
                        if p.response.is_none()
                            && p.filter == packet.filter()
                            && (!paused || p.bulk) =>
                    {
                        p.response = Some(packet.payload);
                        None
                    }
                    _ => Some(packet),
                }
            };
            match unmatched {
                None => self.inner.cond.notify_all(),
                Some(packet) => self.forward_output(packet),
            }
        }
    }

    fn forward_raw(&self, data: &[u8]) {
        let mut sink = lock(&self.inner.raw);
        if let Some(tx) = sink.as_ref()
            && tx.send(data.to_vec()).is_err()
        {
            debug!("Raw subscriber gone");
            *sink = None;
        }
    }

    fn forward_output(&self, packet: Packet) {
        let mut sink = lock(&self.inner.output);
        match sink.as_ref() {
            Some(tx) => {
                if tx.send(packet).is_err() {
                    debug!("Output subscriber gone");
                    *sink = None;
                }
            }
            None => trace!(filter = %format!("{:#06x}", packet.filter()), "Unmatched packet dropped"),
        }
    }

    /// Spawn the background reader. Idempotent.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), TransportError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let center = self.clone();
        let handle = thread::Builder::new()
            .name("openrtk-reader".into())
            .spawn(move || center.read_loop())
            .inspect_err(|_| self.inner.running.store(false, Ordering::SeqCst))?;
        *lock(&self.inner.reader) = Some(handle);
        Ok(())
    }

    /// Stop the background reader and wait for it to exit.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = lock(&self.inner.reader).take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("Reader thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn read_loop(&self) {
        info!("Reader started");
        while self.inner.running.load(Ordering::SeqCst) {
            match self.inner.comm.read(READ_CHUNK) {
                Ok(data) => self.dispatch(&data),
                Err(TransportError::Timeout { .. }) => {}
                Err(TransportError::Disconnected) => {
                    warn!("Communicator disconnected");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    thread::sleep(READ_BACKOFF);
                }
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        info!("Reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockCommunicator;

    fn center(policy: PausePolicy) -> (Arc<MockCommunicator>, MessageCenter<MockCommunicator>) {
        let mock = Arc::new(MockCommunicator::ethernet());
        let center = MessageCenter::with_policy(Arc::clone(&mock), policy);
        center.start().unwrap();
        (mock, center)
    }

    fn cmd(center: &MessageCenter<MockCommunicator>, id: [u8; 2]) -> Command {
        center.framer().command(id, &[]).unwrap()
    }

    #[test]
    fn test_build_returns_matching_payload() {
        let (mock, center) = center(PausePolicy::Reject);
        mock.respond_to(*b"gA", &[1, 2, 3]);

        let result = center.build(&cmd(&center, *b"gA"), Duration::from_millis(500)).unwrap();
        assert_eq!(result.payload, vec![1, 2, 3]);
        assert_eq!(result.filter, u16::from_be_bytes(*b"gA"));
        center.stop();
    }

    #[test]
    fn test_timeout_then_immediately_ready() {
        let (mock, center) = center(PausePolicy::Reject);
        let timeout = Duration::from_millis(50);

        let err = center.build(&cmd(&center, *b"sC"), timeout).unwrap_err();
        match err {
            ExchangeError::NoResponse { filter, elapsed } => {
                assert_eq!(filter, u16::from_be_bytes(*b"sC"));
                assert!(elapsed >= timeout);
            }
            other => panic!("unexpected {other:?}"),
        }

        mock.respond_to(*b"gA", &[9]);
        let ok = center.build(&cmd(&center, *b"gA"), Duration::from_millis(500)).unwrap();
        assert_eq!(ok.payload, vec![9]);
        center.stop();
    }

    #[test]
    fn test_concurrent_builds_are_serialized() {
        let (mock, center) = center(PausePolicy::Reject);
        mock.respond_to(*b"gA", &[7]);

        let first = {
            let center = center.clone();
            let command = cmd(&center, *b"sC");
            thread::spawn(move || center.build(&command, Duration::from_millis(150)))
        };
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let second = center.build(&cmd(&center, *b"gA"), Duration::from_millis(500)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(second.payload, vec![7]);
        assert!(matches!(first.join().unwrap(), Err(ExchangeError::NoResponse { .. })));
        assert_eq!(mock.written_ids(), vec![*b"sC", *b"gA"]);
        center.stop();
    }

    #[test]
    fn test_pause_mid_exchange_does_not_misattribute() {
        let (mock, center) = center(PausePolicy::Reject);
        let output = center.subscribe_output();

        let in_flight = {
            let center = center.clone();
            let command = cmd(&center, *b"gP");
            thread::spawn(move || center.build(&command, Duration::from_millis(150)))
        };
        thread::sleep(Duration::from_millis(20));
        center.pause();
        mock.inject(&mock.device_frame(*b"gP", &[0xEE]));

        assert!(matches!(
            in_flight.join().unwrap(),
            Err(ExchangeError::NoResponse { .. })
        ));
        let stray = output.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(stray.payload, vec![0xEE]);

        center.resume();
        mock.respond_to(*b"gA", &[1]);
        assert!(center.build(&cmd(&center, *b"gA"), Duration::from_millis(500)).is_ok());
        center.stop();
    }

    #[test]
    fn test_paused_policies() {
        let (mock, center) = center(PausePolicy::Reject);
        center.pause();
        assert_eq!(
            center.build(&cmd(&center, *b"gA"), Duration::from_millis(50)),
            Err(ExchangeError::Paused)
        );
        mock.respond_to([0x03, 0xAA], &[]);
        assert!(center.write_read(&cmd(&center, [0x03, 0xAA]), Duration::from_millis(500)).is_ok());
        center.stop();

        let (mock, center) = self::center(PausePolicy::Block);
        mock.respond_to(*b"gA", &[5]);
        center.pause();
        let resumer = {
            let center = center.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                center.resume();
            })
        };
        let result = center.build(&cmd(&center, *b"gA"), Duration::from_millis(500)).unwrap();
        assert_eq!(result.payload, vec![5]);
        resumer.join().unwrap();
        center.stop();
    }

    #[test]
    fn test_write_rejected_is_reported() {
        let (mock, center) = center(PausePolicy::Reject);
        mock.set_writable(false);
        assert!(matches!(
            center.build(&cmd(&center, *b"gA"), Duration::from_millis(100)),
            Err(ExchangeError::WriteRejected { .. })
        ));

        mock.set_writable(true);
        mock.respond_to(*b"gA", &[]);
        assert!(center.build(&cmd(&center, *b"gA"), Duration::from_millis(500)).is_ok());
        center.stop();
    }

    #[test]
    fn test_dispatch_forwards_unmatched_and_raw() {
        let mock = Arc::new(MockCommunicator::ethernet());
        let center = MessageCenter::new(Arc::clone(&mock));
        let output = center.subscribe_output();
        let raw = center.subscribe_raw();

        let frame = mock.device_frame([0x06, 0x0A], &[1, 2]);
        center.dispatch(&frame);

        assert_eq!(raw.try_recv().unwrap(), frame);
        let packet = output.try_recv().unwrap();
        assert_eq!(packet.id, [0x06, 0x0A]);
        assert_eq!(packet.payload, vec![1, 2]);
    }

    #[test]
    fn test_detached_output_is_restored() {
        let mock = Arc::new(MockCommunicator::ethernet());
        let center = MessageCenter::new(Arc::clone(&mock));
        let output = center.subscribe_output();

        let detached = center.detach_output().unwrap();
        center.dispatch(&mock.device_frame([0x06, 0x0A], &[1]));
        assert!(output.try_recv().is_err());

        center.reattach_output(detached);
        center.dispatch(&mock.device_frame([0x06, 0x0A], &[2]));
        assert_eq!(output.try_recv().unwrap().payload, vec![2]);

        let newer = center.subscribe_output();
        let detached = center.detach_output().unwrap();
        let _ = center.subscribe_output();
        center.reattach_output(detached);
        center.dispatch(&mock.device_frame([0x06, 0x0A], &[3]));
        assert!(newer.try_recv().is_err());
    }
}
