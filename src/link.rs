//! One hub-to-peripheral serial link.
//!
//! Outgoing lines go through a small bounded queue and are written with
//! [`LineWriter::write_line`], which never blocks. Settings and pattern
//! selects are tracked until the peripheral echoes them back; everything
//! else is fire-and-forget.

use crate::protocol::{LineAssembler, LineBuffer, Message, ParseError, ProtocolError};
use crate::settings::SettingKey;
use alloc::string::{String, ToString};
use alloc::vec::Vec as AllocVec;
use heapless::Vec;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_MAX_RETRIES: u8 = 3;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 3000;

pub const OUTPUT_QUEUE_DEPTH: usize = 32;
pub const MAX_PENDING_ACKS: usize = 16;

/// Non-blocking sink for complete lines. Implementations add the newline.
pub trait LineWriter {
    type Error: core::fmt::Debug;

    fn write_line(&mut self, line: &str) -> nb::Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("output queue full of critical lines")]
    QueueFull,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub ack_timeout_ms: u64,
    pub max_retries: u8,
    pub ping_interval_ms: u64,
    pub liveness_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// Last write failed, or nothing has been written yet.
    Disconnected,
    /// Reconnected; a full replay is in flight.
    Syncing,
    Synced,
    /// A tracked line ran out of retries. Cleared by the next resync.
    Unsynced,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkStats {
    pub lines_sent: u32,
    pub lines_received: u32,
    pub parse_errors: u32,
    pub truncated: u32,
    pub telemetry_coalesced: u32,
    pub telemetry_dropped: u32,
    pub discarded_offline: u32,
    pub retries: u32,
    pub ack_timeouts: u32,
    pub write_failures: u32,
    pub reconnects: u32,
    pub peer_resets: u32,
}

/// What a tracked line is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKey {
    Setting(SettingKey),
    Pattern,
}

fn ack_key(message: &Message) -> Option<AckKey> {
    match message {
        Message::SettingSet(s) => Some(AckKey::Setting(s.key())),
        Message::PatternSelect(_) => Some(AckKey::Pattern),
        _ => None,
    }
}

/// Whether `reply` acknowledges `sent`. The echo has to carry the same value.
fn acknowledges(sent: &Message, reply: &Message) -> bool {
    match (sent, reply) {
        (Message::SettingSet(a), Message::SettingAck(b)) => a == b,
        (Message::PatternSelect(a), Message::PatternOk(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    key: AckKey,
    message: Message,
    sent_at: u64,
    retries: u8,
}

pub struct SerialLink<W: LineWriter> {
    name: &'static str,
    writer: W,
    config: LinkConfig,
    state: LinkState,
    queue: Vec<Message, OUTPUT_QUEUE_DEPTH>,
    pending: Vec<PendingAck, MAX_PENDING_ACKS>,
    assembler: LineAssembler,
    resync_requested: bool,
    telemetry_cursor: u64,
    telemetry_caught_up: bool,
    last_rx_at: Option<u64>,
    last_ping_at: Option<u64>,
    stats: LinkStats,
}

impl<W: LineWriter> SerialLink<W> {
    pub fn new(name: &'static str, writer: W, config: LinkConfig) -> Self {
        Self {
            name,
            writer,
            config,
            state: LinkState::Disconnected,
            queue: Vec::new(),
            pending: Vec::new(),
            assembler: LineAssembler::new(),
            resync_requested: false,
            telemetry_cursor: 0,
            telemetry_caught_up: false,
            last_rx_at: None,
            last_ping_at: None,
            stats: LinkStats::default(),
        }
    }

    /// Queue a message. Telemetry is lossy: it replaces a queued value for
    /// the same name and may be dropped when the queue is full. Critical
    /// lines are never dropped; `WouldBlock` means try again later.
    ///
    /// While disconnected only `PING` is queued, since the resync that
    /// follows a reconnect replays everything else.
    pub fn send(&mut self, message: Message) -> nb::Result<(), LinkError> {
        message.encode().map_err(|e| nb::Error::Other(e.into()))?;

        if self.state == LinkState::Disconnected && message != Message::Ping {
            self.stats.discarded_offline = self.stats.discarded_offline.wrapping_add(1);
            return Ok(());
        }

        if let Message::Telemetry { name, .. } = message {
            let queued = self
                .queue
                .iter_mut()
                .find(|m| matches!(m, Message::Telemetry { name: n, .. } if *n == name));
            if let Some(slot) = queued {
                *slot = message;
                self.stats.telemetry_coalesced = self.stats.telemetry_coalesced.wrapping_add(1);
                return Ok(());
            }
        } else if let Some(key) = ack_key(&message) {
            // a newer value for the same key supersedes the queued one
            if let Some(slot) = self.queue.iter_mut().find(|m| ack_key(m) == Some(key)) {
                *slot = message;
                return Ok(());
            }
        }

        if self.queue.is_full() && !self.evict_oldest_telemetry() {
            if message.is_critical() {
                return Err(nb::Error::WouldBlock);
            }
            self.stats.telemetry_dropped = self.stats.telemetry_dropped.wrapping_add(1);
            return Ok(());
        }

        // room was checked above
        let _ = self.queue.push(message);
        Ok(())
    }

    /// Whether `send` would queue `message` without evicting anything.
    pub fn has_room_for(&self, message: &Message) -> bool {
        if !self.queue.is_full() {
            return true;
        }
        match message {
            Message::Telemetry { name, .. } => self
                .queue
                .iter()
                .any(|m| matches!(m, Message::Telemetry { name: n, .. } if n == name)),
            _ => ack_key(message).is_some_and(|key| self.queue.iter().any(|m| ack_key(m) == Some(key))),
        }
    }

    fn evict_oldest_telemetry(&mut self) -> bool {
        match self.queue.iter().position(|m| !m.is_critical()) {
            Some(index) => {
                self.queue.remove(index);
                self.stats.telemetry_dropped = self.stats.telemetry_dropped.wrapping_add(1);
                // the evicted value has to go out again
                self.telemetry_cursor = 0;
                self.telemetry_caught_up = false;
                true
            }
            None => false,
        }
    }

    /// Write queued lines until the writer would block or fails.
    pub fn flush(&mut self, now: u64) {
        while let Some(message) = self.queue.first().copied() {
            let line = match message.encode() {
                Ok(line) => line,
                Err(e) => {
                    warn!("{} link: dropping unencodable message: {}", self.name, e);
                    self.queue.remove(0);
                    continue;
                }
            };

            match self.writer.write_line(&line) {
                Ok(()) => {
                    self.queue.remove(0);
                    self.stats.lines_sent = self.stats.lines_sent.wrapping_add(1);
                    self.on_write_ok(&line);
                    self.track(message, now);
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    self.on_write_failed(&e);
                    break;
                }
            }
        }
        self.settle();
    }

    fn on_write_ok(&mut self, line: &LineBuffer) {
        if self.state == LinkState::Disconnected {
            self.stats.reconnects = self.stats.reconnects.wrapping_add(1);
            info!("{} link up (first line '{}'), resyncing", self.name, line);
            self.begin_resync();
        }
    }

    fn on_write_failed(&mut self, error: &W::Error) {
        self.stats.write_failures = self.stats.write_failures.wrapping_add(1);
        if self.state != LinkState::Disconnected {
            warn!("{} link write failed ({:?}), marking disconnected", self.name, error);
        }
        self.state = LinkState::Disconnected;
        self.queue.clear();
        self.pending.clear();
    }

    fn track(&mut self, message: Message, now: u64) {
        let Some(key) = ack_key(&message) else {
            return;
        };
        if let Some(entry) = self.pending.iter_mut().find(|p| p.key == key) {
            if entry.message != message {
                entry.message = message;
                entry.retries = 0;
            }
            entry.sent_at = now;
            return;
        }
        let entry = PendingAck { key, message, sent_at: now, retries: 0 };
        if self.pending.push(entry).is_err() {
            warn!("{} link: ack table full, {:?} sent untracked", self.name, key);
        }
    }

    /// Handle one complete received line. Acks, pings and resets are dealt
    /// with here and still handed back so the caller can observe them.
    pub fn on_receive(&mut self, line: &str, now: u64) -> Option<Message> {
        self.last_rx_at = Some(now);
        self.stats.lines_received = self.stats.lines_received.wrapping_add(1);

        let message = Message::parse(line);
        match message {
            Message::Unparseable(reason) => {
                self.record_parse_error(reason, line);
                return None;
            }
            Message::SettingAck(_) | Message::PatternOk(_) => self.on_ack(&message),
            Message::Ping => {
                if self.send(Message::Pong).is_err() {
                    debug!("{} link: no room for PONG", self.name);
                }
            }
            Message::Reset => {
                self.stats.peer_resets = self.stats.peer_resets.wrapping_add(1);
                info!("{} peripheral rebooted, resyncing", self.name);
                self.request_resync();
            }
            _ => {}
        }
        Some(message)
    }

    /// Feed raw bytes from the wire; returns the message completed by `byte`.
    pub fn on_byte(&mut self, byte: u8, now: u64) -> Option<Message> {
        match self.assembler.feed(byte)? {
            Ok(line) => self.on_receive(&line, now),
            Err(reason) => {
                self.last_rx_at = Some(now);
                self.record_parse_error(reason, self.name);
                None
            }
        }
    }

    /// Every message completed by `bytes`, in order.
    pub fn on_bytes(&mut self, bytes: &[u8], now: u64) -> AllocVec<Message> {
        bytes.iter().filter_map(|b| self.on_byte(*b, now)).collect()
    }

    fn record_parse_error(&mut self, reason: ParseError, context: &str) {
        self.stats.parse_errors = self.stats.parse_errors.wrapping_add(1);
        if reason == ParseError::Truncated {
            self.stats.truncated = self.stats.truncated.wrapping_add(1);
        }
        debug!("{} link: discarded line ({:?}): {}", self.name, reason, context);
    }

    fn on_ack(&mut self, reply: &Message) {
        let before = self.pending.len();
        self.pending.retain(|p| !acknowledges(&p.message, reply));
        if self.pending.len() == before {
            debug!("{} link: unmatched ack {:?}", self.name, reply);
        }
        self.settle();
    }

    fn settle(&mut self) {
        // the replay has not been queued until the caller takes the request
        if self.resync_requested {
            return;
        }
        if self.state != LinkState::Syncing || !self.telemetry_caught_up || !self.pending.is_empty() {
            return;
        }
        let replay_queued = self
            .queue
            .iter()
            .any(|m| ack_key(m).is_some() || matches!(m, Message::Telemetry { .. }));
        if !replay_queued {
            info!("{} link synced", self.name);
            self.state = LinkState::Synced;
        }
    }

    /// Periodic work: liveness pings, ack timeouts and retries, then flush.
    pub fn poll(&mut self, now: u64) {
        let ping_due = self
            .last_ping_at
            .map_or(true, |at| now.saturating_sub(at) >= self.config.ping_interval_ms);
        if ping_due && self.send(Message::Ping).is_ok() {
            self.last_ping_at = Some(now);
        }

        self.check_acks(now);
        self.flush(now);
    }

    fn check_acks(&mut self, now: u64) {
        let mut index = 0;
        while index < self.pending.len() {
            let entry = self.pending[index];
            if now.saturating_sub(entry.sent_at) < self.config.ack_timeout_ms {
                index += 1;
                continue;
            }

            if entry.retries < self.config.max_retries {
                // a full queue leaves the entry due, so the next poll tries again
                if self.send(entry.message).is_err() {
                    index += 1;
                    continue;
                }
                self.stats.ack_timeouts = self.stats.ack_timeouts.wrapping_add(1);
                debug!(
                    "{} link: no ack for {:?}, retry {}/{}",
                    self.name, entry.message, entry.retries + 1, self.config.max_retries
                );
                self.pending[index].retries += 1;
                self.pending[index].sent_at = now;
                self.stats.retries = self.stats.retries.wrapping_add(1);
                index += 1;
            } else {
                self.stats.ack_timeouts = self.stats.ack_timeouts.wrapping_add(1);
                warn!(
                    "{} link: {:?} unacknowledged after {} retries, link unsynced",
                    self.name, entry.message, self.config.max_retries
                );
                self.pending.remove(index);
                self.state = LinkState::Unsynced;
            }
        }
    }

    /// Ask for a full replay on the next [`SerialLink::take_resync`].
    pub fn request_resync(&mut self) {
        if self.state != LinkState::Disconnected {
            self.begin_resync();
        }
    }

    fn begin_resync(&mut self) {
        self.state = LinkState::Syncing;
        self.pending.clear();
        self.queue.retain(|m| *m == Message::Ping);
        self.telemetry_cursor = 0;
        self.telemetry_caught_up = false;
        self.resync_requested = true;
    }

    /// True once per reconnect or peer reset; the caller must then replay
    /// every setting and the whole snapshot. The link stays `Syncing` until
    /// [`SerialLink::advance_telemetry`] reports the snapshot caught up and
    /// everything replayed has been written and acknowledged.
    pub fn take_resync(&mut self) -> bool {
        core::mem::take(&mut self.resync_requested)
    }

    pub fn telemetry_cursor(&self) -> u64 {
        self.telemetry_cursor
    }

    /// Record the highest snapshot revision queued on this link. `caught_up`
    /// says nothing newer is waiting for queue space.
    pub fn advance_telemetry(&mut self, revision: u64, caught_up: bool) {
        self.telemetry_cursor = revision;
        self.telemetry_caught_up = caught_up;
    }

    /// Heard from the peer within the liveness timeout.
    pub fn is_alive(&self, now: u64) -> bool {
        self.last_rx_at
            .is_some_and(|at| now.saturating_sub(at) <= self.config.liveness_timeout_ms)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn truncated_lines(&self) -> u32 {
        self.assembler.truncated()
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

/// A writer that keeps lines in memory. Can be told to refuse writes or to
/// report the line as down.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    lines: AllocVec<String>,
    down: bool,
    blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineDown;

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&mut self, down: bool) {
        self.down = down;
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn take_lines(&mut self) -> AllocVec<String> {
        core::mem::take(&mut self.lines)
    }
}

impl LineWriter for MemoryWriter {
    type Error = LineDown;

    fn write_line(&mut self, line: &str) -> nb::Result<(), LineDown> {
        if self.down {
            return Err(nb::Error::Other(LineDown));
        }
        if self.blocked {
            return Err(nb::Error::WouldBlock);
        }
        self.lines.push(line.to_string());
        Ok(())
    }
}
