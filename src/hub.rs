//! The hub node: owns the snapshot, the settings store and both peripheral
//! links, and drives all of them from one cooperative `tick`.

use crate::link::{LineWriter, LinkConfig, LinkError, LinkState, SerialLink};
use crate::listener::{BusListener, PassiveBus};
use crate::protocol::{Command, Message};
use crate::settings::{
    LoadReport, Setting, SettingKey, SettingsBackend, SettingsError, SettingsStore,
};
use crate::snapshot::{Signal, Snapshot, DEFAULT_STALE_AFTER_MS};
use alloc::vec::Vec;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SCREEN_COUNT: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeripheralId {
    LedUnit,
    DisplayUnit,
}

impl PeripheralId {
    pub const ALL: [PeripheralId; 2] = [PeripheralId::LedUnit, PeripheralId::DisplayUnit];

    pub const fn as_str(self) -> &'static str {
        match self {
            PeripheralId::LedUnit => "led",
            PeripheralId::DisplayUnit => "display",
        }
    }
}

impl core::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("{peripheral} link: {source}")]
    Link {
        peripheral: PeripheralId,
        source: LinkError,
    },
    #[error("{peripheral} link output queue is full")]
    Busy { peripheral: PeripheralId },
    #[error("screen {screen} out of range (0..{count})")]
    ScreenOutOfRange { screen: u8, count: u8 },
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub link: LinkConfig,
    pub stale_after_ms: u64,
    pub screen_count: u8,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            screen_count: DEFAULT_SCREEN_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HubState {
    pub running: bool,
    pub started_at: u64,
    pub ticks: u64,
    pub settings_changed: u32,
    pub settings_rejected: u32,
    pub telemetry_pushed: u32,
    pub peripheral_requests: u32,
    pub resyncs: u32,
}

/// Display state that the hub re-sends on every display resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayControls {
    pub screen: u8,
    pub dim: bool,
    pub mute: bool,
}

pub struct Hub<S: SettingsBackend, W: LineWriter, C: PassiveBus> {
    snapshot: Snapshot,
    settings: SettingsStore<S>,
    led: SerialLink<W>,
    display: SerialLink<W>,
    listeners: Vec<BusListener<C>>,
    config: HubConfig,
    controls: DisplayControls,
    state: HubState,
}

impl<S: SettingsBackend, W: LineWriter, C: PassiveBus> Hub<S, W, C> {
    pub fn new(settings: S, led_writer: W, display_writer: W, config: HubConfig) -> Self {
        Self {
            snapshot: Snapshot::with_stale_after(config.stale_after_ms),
            settings: SettingsStore::new(settings),
            led: SerialLink::new(PeripheralId::LedUnit.as_str(), led_writer, config.link),
            display: SerialLink::new(PeripheralId::DisplayUnit.as_str(), display_writer, config.link),
            listeners: Vec::new(),
            config,
            controls: DisplayControls { screen: 0, dim: false, mute: false },
            state: HubState::default(),
        }
    }

    pub fn add_listener(&mut self, listener: BusListener<C>) {
        self.listeners.push(listener);
    }

    /// Load persisted settings and start running.
    pub fn start(&mut self, now: u64) -> LoadReport {
        let report = self.settings.load_all();
        self.state.running = true;
        self.state.started_at = now;
        info!(
            "hub started with {} bus listener(s), {} setting(s) from storage",
            self.listeners.len(),
            report.loaded
        );
        report
    }

    pub fn stop(&mut self) {
        self.state.running = false;
        info!("hub stopped");
    }

    /// One main-loop iteration.
    pub fn tick(&mut self, now: u64) {
        if !self.state.running {
            return;
        }
        self.state.ticks = self.state.ticks.wrapping_add(1);

        for listener in &mut self.listeners {
            listener.poll(&mut self.snapshot, now);
        }
        let expired = self.snapshot.expire(now);
        if expired > 0 {
            debug!("{} signal(s) went stale", expired);
        }

        for peripheral in PeripheralId::ALL {
            self.service_link(peripheral, now);
        }
    }

    fn service_link(&mut self, peripheral: PeripheralId, now: u64) {
        self.link_mut(peripheral).poll(now);
        if self.link_mut(peripheral).take_resync() {
            self.replay(peripheral);
        }
        self.push_telemetry(peripheral, now);
        self.link_mut(peripheral).flush(now);
    }

    /// Queue every setting (and the display controls) on one link.
    fn replay(&mut self, peripheral: PeripheralId) {
        self.state.resyncs = self.state.resyncs.wrapping_add(1);
        info!("replaying settings to {}", peripheral);

        let settings = *self.settings.settings();
        let controls = self.controls;
        let link = self.link_mut(peripheral);
        let mut blocked = false;

        for setting in settings.iter() {
            blocked |= link.send(setting_message(peripheral, setting)).is_err();
        }
        if peripheral == PeripheralId::DisplayUnit {
            for command in [
                Command::Screen(controls.screen),
                Command::Dim(controls.dim),
                Command::Mute(controls.mute),
            ] {
                blocked |= link.send(Message::Command(command)).is_err();
            }
        }
        if blocked {
            warn!("{} link queue full during replay, will replay again", peripheral);
            link.request_resync();
        }
    }

    /// Queue changed signals oldest revision first, only while the link has
    /// room, so nothing queued is evicted. Whatever does not fit goes out on
    /// a later tick.
    fn push_telemetry(&mut self, peripheral: PeripheralId, now: u64) {
        let link = match peripheral {
            PeripheralId::LedUnit => &mut self.led,
            PeripheralId::DisplayUnit => &mut self.display,
        };
        if link.state() == LinkState::Disconnected {
            return;
        }

        let mut changed: Vec<&Signal> = self.snapshot.changed_since(link.telemetry_cursor(), now).collect();
        changed.sort_unstable_by_key(|s| s.revision);

        let mut cursor = link.telemetry_cursor();
        let mut caught_up = true;
        for signal in changed {
            match Message::telemetry(&signal.name, signal.value) {
                Ok(message) => {
                    if !link.has_room_for(&message) {
                        caught_up = false;
                        break;
                    }
                    if link.send(message).is_ok() {
                        self.state.telemetry_pushed = self.state.telemetry_pushed.wrapping_add(1);
                    }
                }
                Err(e) => debug!("not forwarding '{}': {}", signal.name, e),
            }
            cursor = signal.revision;
        }
        if caught_up {
            cursor = self.snapshot.revision();
        }
        link.advance_telemetry(cursor, caught_up);
    }

    /// Validate, persist and broadcast a setting. `Ok(false)` means the value
    /// was already current and nothing was sent.
    pub fn set_setting(&mut self, setting: Setting) -> Result<bool, HubError> {
        let changed = match self.settings.set(setting) {
            Ok(changed) => changed,
            Err(e) => {
                self.state.settings_rejected = self.state.settings_rejected.wrapping_add(1);
                warn!("rejected {}: {}", setting, e);
                return Err(e.into());
            }
        };
        if !changed {
            return Ok(false);
        }

        self.state.settings_changed = self.state.settings_changed.wrapping_add(1);
        info!("setting changed: {}", setting);
        for peripheral in PeripheralId::ALL {
            let link = self.link_mut(peripheral);
            if link.send(setting_message(peripheral, setting)).is_err() {
                // the replay carries the new value
                warn!("{} link busy, scheduling resync for {}", peripheral, setting.key());
                link.request_resync();
            }
        }
        Ok(true)
    }

    pub fn setting(&self, key: SettingKey) -> Setting {
        self.settings.get(key)
    }

    /// Send an absolute command. The hub remembers display controls so a
    /// reconnecting display gets them back.
    pub fn send_command(&mut self, peripheral: PeripheralId, command: Command) -> Result<(), HubError> {
        if let Command::Screen(screen) = command {
            if screen >= self.config.screen_count {
                return Err(HubError::ScreenOutOfRange { screen, count: self.config.screen_count });
            }
        }
        if peripheral == PeripheralId::DisplayUnit {
            match command {
                Command::Screen(n) => self.controls.screen = n,
                Command::Dim(on) => self.controls.dim = on,
                Command::Mute(on) => self.controls.mute = on,
            }
        }
        match self.link_mut(peripheral).send(Message::Command(command)) {
            Ok(()) => Ok(()),
            Err(nb::Error::WouldBlock) => Err(HubError::Busy { peripheral }),
            Err(nb::Error::Other(source)) => Err(HubError::Link { peripheral, source }),
        }
    }

    pub fn select_screen(&mut self, screen: u8) -> Result<(), HubError> {
        self.send_command(PeripheralId::DisplayUnit, Command::Screen(screen))
    }

    /// Move `delta` screens from the current one, wrapping around. Goes out
    /// as an absolute screen number.
    pub fn step_screen(&mut self, delta: i8) -> Result<u8, HubError> {
        let count = i16::from(self.config.screen_count.max(1));
        let target = (i16::from(self.controls.screen) + i16::from(delta)).rem_euclid(count);
        // rem_euclid keeps target in 0..count, which fits u8
        let target = target as u8;
        self.select_screen(target)?;
        Ok(target)
    }

    /// Force a full replay to one peripheral.
    pub fn resync(&mut self, peripheral: PeripheralId) {
        self.link_mut(peripheral).request_resync();
    }

    /// Handle one line received from a peripheral.
    pub fn receive_line(&mut self, peripheral: PeripheralId, line: &str, now: u64) -> Option<Message> {
        let message = self.link_mut(peripheral).on_receive(line, now)?;
        self.handle_message(peripheral, &message, now);
        Some(message)
    }

    /// Handle raw bytes from a peripheral; returns how many messages completed.
    pub fn receive_bytes(&mut self, peripheral: PeripheralId, bytes: &[u8], now: u64) -> usize {
        let messages = self.link_mut(peripheral).on_bytes(bytes, now);
        for message in &messages {
            self.handle_message(peripheral, message, now);
        }
        messages.len()
    }

    fn handle_message(&mut self, peripheral: PeripheralId, message: &Message, now: u64) {
        match *message {
            Message::Telemetry { name, value } => {
                if let Err(e) = self.snapshot.update(&name, value, "", now) {
                    debug!("{} telemetry '{}' not stored: {}", peripheral, name, e);
                }
            }
            Message::SettingSet(setting) => {
                // a peripheral asking for a change made on its own controls
                self.state.peripheral_requests = self.state.peripheral_requests.wrapping_add(1);
                if let Err(e) = self.set_setting(setting) {
                    debug!("{} request {} refused: {}", peripheral, setting, e);
                }
            }
            _ => {}
        }
    }

    /// Write whatever the links have queued.
    pub fn flush(&mut self, now: u64) {
        self.led.flush(now);
        self.display.flush(now);
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn snapshot_mut(&mut self) -> &mut Snapshot {
        &mut self.snapshot
    }

    pub fn settings(&self) -> &SettingsStore<S> {
        &self.settings
    }

    pub fn link(&self, peripheral: PeripheralId) -> &SerialLink<W> {
        match peripheral {
            PeripheralId::LedUnit => &self.led,
            PeripheralId::DisplayUnit => &self.display,
        }
    }

    pub fn link_mut(&mut self, peripheral: PeripheralId) -> &mut SerialLink<W> {
        match peripheral {
            PeripheralId::LedUnit => &mut self.led,
            PeripheralId::DisplayUnit => &mut self.display,
        }
    }

    pub fn listeners(&self) -> &[BusListener<C>] {
        &self.listeners
    }

    pub fn controls(&self) -> DisplayControls {
        self.controls
    }

    pub fn state(&self) -> &HubState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }
}

/// The LED unit selects patterns with `SEQ`; everything else is a `SET`.
fn setting_message(peripheral: PeripheralId, setting: Setting) -> Message {
    match (peripheral, setting) {
        (PeripheralId::LedUnit, Setting::Pattern(n)) => Message::PatternSelect(n),
        _ => Message::SettingSet(setting),
    }
}
