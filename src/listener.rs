//! Passive bus ingestion.
//!
//! A [`BusListener`] owns one bus interface through the [`PassiveBus`] trait,
//! which deliberately has no transmit operation: a listener cannot put a
//! frame or an acknowledgement on the vehicle bus, so the listen-only rule is
//! fixed when the interface is configured rather than checked at runtime.

use crate::decoder::Decoder;
use crate::frame::{BusId, Frame};
use crate::rules::{self, BusSignature};
use crate::snapshot::{SignalName, Snapshot};
use core::fmt::Write;
use embedded_can::{Error as _, ErrorKind};
use heapless::spsc::{Consumer, Producer, Queue};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;
pub const DEFAULT_ERROR_WINDOW_MS: u64 = 1000;
pub const DEFAULT_QUIET_PERIOD_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 250;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 8000;
pub const DEFAULT_MAX_FRAMES_PER_POLL: usize = 32;
const STATUS_REFRESH_MS: u64 = 500;

/// Depth of the interrupt-to-main-loop frame queue (holds N - 1 events).
pub const IRQ_QUEUE_DEPTH: usize = 64;

/// A receive-only bus interface.
pub trait PassiveBus {
    type Error: embedded_can::Error;

    /// Next received frame, `WouldBlock` when nothing is pending.
    fn receive(&mut self) -> nb::Result<Frame, Self::Error>;

    /// Take the interface down and bring it back up in listen-only mode.
    fn reset(&mut self) -> Result<(), Self::Error>;
}

/// What the frame-arrival interrupt hands to the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Frame(Frame),
    Error(ErrorKind),
}

pub type IrqQueue = Queue<BusEvent, IRQ_QUEUE_DEPTH>;

/// Interrupt side of the queue. Only copies events in; never decodes.
pub struct IrqProducer<'a> {
    producer: Producer<'a, BusEvent, IRQ_QUEUE_DEPTH>,
    overruns: u32,
}

impl<'a> IrqProducer<'a> {
    pub fn on_frame(&mut self, frame: Frame) {
        if self.producer.enqueue(BusEvent::Frame(frame)).is_err() {
            self.overruns = self.overruns.wrapping_add(1);
        }
    }

    pub fn on_error(&mut self, kind: ErrorKind) {
        if self.producer.enqueue(BusEvent::Error(kind)).is_err() {
            self.overruns = self.overruns.wrapping_add(1);
        }
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }
}

/// Main-loop side of the interrupt queue, usable as a [`PassiveBus`].
///
/// `reset` is whatever restarts the controller in listen-only mode.
pub struct IrqBus<'a, R> {
    consumer: Consumer<'a, BusEvent, IRQ_QUEUE_DEPTH>,
    reset: R,
}

impl<'a, R> IrqBus<'a, R>
where
    R: FnMut() -> Result<(), ErrorKind>,
{
    pub fn split(queue: &'a mut IrqQueue, reset: R) -> (IrqProducer<'a>, Self) {
        let (producer, consumer) = queue.split();
        (
            IrqProducer { producer, overruns: 0 },
            Self { consumer, reset },
        )
    }
}

impl<'a, R> PassiveBus for IrqBus<'a, R>
where
    R: FnMut() -> Result<(), ErrorKind>,
{
    type Error = ErrorKind;

    fn receive(&mut self) -> nb::Result<Frame, ErrorKind> {
        match self.consumer.dequeue() {
            Some(BusEvent::Frame(frame)) => Ok(frame),
            Some(BusEvent::Error(kind)) => Err(nb::Error::Other(kind)),
            None => Err(nb::Error::WouldBlock),
        }
    }

    fn reset(&mut self) -> Result<(), ErrorKind> {
        while self.consumer.dequeue().is_some() {}
        (self.reset)()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    pub error_threshold: u32,
    pub error_window_ms: u64,
    pub quiet_period_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_frames_per_poll: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            error_window_ms: DEFAULT_ERROR_WINDOW_MS,
            quiet_period_ms: DEFAULT_QUIET_PERIOD_MS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            max_frames_per_poll: DEFAULT_MAX_FRAMES_PER_POLL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ListenerStats {
    pub frames: u32,
    pub signals: u32,
    pub errors: u32,
    pub resets: u32,
    pub reset_failures: u32,
    pub unbound_frames: u32,
    pub snapshot_rejects: u32,
}

pub struct BusListener<B: PassiveBus> {
    bus: B,
    decoder: Decoder,
    config: ListenerConfig,
    binding: Option<BusId>,
    signatures: &'static [BusSignature],
    status_name: SignalName,

    started_at: Option<u64>,
    last_frame_at: Option<u64>,
    last_status_at: Option<u64>,
    online: bool,

    window_start: u64,
    window_errors: u32,
    backoff_ms: u64,
    next_reset_at: u64,

    stats: ListenerStats,
}

impl<B: PassiveBus> BusListener<B> {
    /// Listener for an interface whose bus is known up front.
    pub fn new(bus: B, decoder: Decoder, bus_id: BusId, config: ListenerConfig) -> Self {
        let mut listener = Self::unbound(bus, decoder, bus_id, &[], config);
        listener.bind(bus_id);
        listener
    }

    /// Listener that works out which bus it is on from the traffic it sees.
    ///
    /// Frames are counted but not decoded until one of `signatures` shows up.
    /// Until then liveness is published as `ifaceN_online`, N being
    /// `interface`, so a bus that never speaks still shows up as offline.
    pub fn unbound(
        bus: B,
        decoder: Decoder,
        interface: u8,
        signatures: &'static [BusSignature],
        config: ListenerConfig,
    ) -> Self {
        let mut status_name = SignalName::new();
        // "iface255_online" always fits in a SignalName
        let _ = write!(status_name, "iface{}_online", interface);
        Self {
            bus,
            decoder,
            backoff_ms: config.backoff_initial_ms,
            config,
            binding: None,
            signatures,
            status_name,
            started_at: None,
            last_frame_at: None,
            last_status_at: None,
            online: false,
            window_start: 0,
            window_errors: 0,
            next_reset_at: 0,
            stats: ListenerStats::default(),
        }
    }

    /// Drain up to `max_frames_per_poll` frames into `snapshot`, then run
    /// error and liveness bookkeeping. Never fails: every bus problem turns
    /// into a reset attempt and a status signal.
    pub fn poll(&mut self, snapshot: &mut Snapshot, now: u64) {
        self.started_at.get_or_insert(now);

        for _ in 0..self.config.max_frames_per_poll {
            match self.bus.receive() {
                Ok(frame) => self.handle_frame(&frame, snapshot, now),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => self.record_error(e.kind(), now),
            }
        }

        self.check_errors(now);
        self.check_liveness(snapshot, now);
    }

    fn handle_frame(&mut self, frame: &Frame, snapshot: &mut Snapshot, now: u64) {
        self.stats.frames = self.stats.frames.wrapping_add(1);
        self.last_frame_at = Some(now);

        let bus_id = match self.binding {
            Some(bus_id) => bus_id,
            None => match rules::identify(self.signatures, frame.frame_id()) {
                Some(bus_id) => {
                    info!("{} identified as bus {} by frame {}", self.status_name, bus_id, frame.frame_id());
                    snapshot.invalidate(&self.status_name);
                    self.bind(bus_id);
                    self.last_status_at = None;
                    bus_id
                }
                None => {
                    self.stats.unbound_frames = self.stats.unbound_frames.wrapping_add(1);
                    return;
                }
            },
        };

        let decoded = self.decoder.decode(bus_id, frame.frame_id(), frame.payload());
        for signal in &decoded {
            match snapshot.update(signal.name, signal.value, signal.unit, now) {
                Ok(_) => self.stats.signals = self.stats.signals.wrapping_add(1),
                Err(_) => self.stats.snapshot_rejects = self.stats.snapshot_rejects.wrapping_add(1),
            }
        }
    }

    fn record_error(&mut self, kind: ErrorKind, now: u64) {
        if now.saturating_sub(self.window_start) > self.config.error_window_ms {
            self.window_start = now;
            self.window_errors = 0;
        }
        self.window_errors += 1;
        self.stats.errors = self.stats.errors.wrapping_add(1);
        debug!("bus {:?} error: {:?}", self.binding, kind);
    }

    fn check_errors(&mut self, now: u64) {
        if self.window_errors >= self.config.error_threshold {
            if now >= self.next_reset_at {
                warn!(
                    "bus {:?}: {} errors within {} ms, resetting interface",
                    self.binding, self.window_errors, self.config.error_window_ms
                );
                self.reset_interface(now);
            }
        } else if self.window_errors == 0
            && self.online
            && now.saturating_sub(self.window_start) > self.config.error_window_ms
        {
            // a clean window with traffic earns the short backoff back
            self.backoff_ms = self.config.backoff_initial_ms;
        }
    }

    fn check_liveness(&mut self, snapshot: &mut Snapshot, now: u64) {
        let since = self.last_frame_at.or(self.started_at).unwrap_or(now);
        let online = self.last_frame_at.is_some()
            && now.saturating_sub(since) <= self.config.quiet_period_ms;

        if online != self.online {
            if online {
                info!("bus {:?} online", self.binding);
            } else {
                warn!("bus {:?} quiet for {} ms, marking offline", self.binding, now.saturating_sub(since));
            }
            self.online = online;
            self.last_status_at = None;
        }

        if !online
            && now.saturating_sub(since) > self.config.quiet_period_ms
            && now >= self.next_reset_at
        {
            self.reset_interface(now);
        }

        let due = self
            .last_status_at
            .map_or(true, |at| now.saturating_sub(at) >= STATUS_REFRESH_MS);
        if due {
            let value = if online { 1.0 } else { 0.0 };
            if snapshot.update(&self.status_name, value, "", now).is_err() {
                self.stats.snapshot_rejects = self.stats.snapshot_rejects.wrapping_add(1);
            }
            self.last_status_at = Some(now);
        }
    }

    fn reset_interface(&mut self, now: u64) {
        self.stats.resets = self.stats.resets.wrapping_add(1);
        match self.bus.reset() {
            Ok(()) => {
                info!("bus {:?} interface reset, next retry in {} ms", self.binding, self.backoff_ms);
            }
            Err(e) => {
                self.stats.reset_failures = self.stats.reset_failures.wrapping_add(1);
                warn!("bus {:?} reset failed: {:?}", self.binding, e.kind());
            }
        }
        self.window_start = now;
        self.window_errors = 0;
        self.next_reset_at = now + self.backoff_ms;
        self.backoff_ms = (self.backoff_ms * 2).min(self.config.backoff_max_ms);
    }

    fn bind(&mut self, bus_id: BusId) {
        self.binding = Some(bus_id);
        self.status_name.clear();
        // "bus255_online" always fits in a SignalName
        let _ = write!(self.status_name, "bus{}_online", bus_id);
    }

    pub fn binding(&self) -> Option<BusId> {
        self.binding
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// `busN_online` once bound, `ifaceN_online` before that.
    pub fn status_signal(&self) -> &str {
        self.status_name.as_str()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn current_backoff_ms(&self) -> u64 {
        self.backoff_ms
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}
