//! Peripheral side of a link: mirrors what the hub pushes and produces the
//! replies the hub waits for.

use crate::protocol::{Command, Message, ParseError};
use crate::settings::{Setting, Settings, PATTERN_COUNT};
use crate::snapshot::Snapshot;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MirrorStats {
    pub telemetry: u32,
    pub settings_applied: u32,
    pub settings_rejected: u32,
    pub commands: u32,
    pub parse_errors: u32,
}

#[derive(Debug)]
pub struct PeripheralMirror {
    settings: Settings,
    telemetry: Snapshot,
    screen: u8,
    dim: bool,
    mute: bool,
    last_parse_error: Option<ParseError>,
    stats: MirrorStats,
}

impl PeripheralMirror {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            telemetry: Snapshot::new(),
            screen: 0,
            dim: false,
            mute: false,
            last_parse_error: None,
            stats: MirrorStats::default(),
        }
    }

    /// Apply one line from the hub and return the reply to send, if any.
    ///
    /// A `SET` outside its bounds is dropped without a `SETACK`, so the hub
    /// keeps retrying and eventually marks the link unsynced.
    pub fn handle_line(&mut self, line: &str, now: u64) -> Option<Message> {
        match Message::parse(line) {
            Message::Telemetry { name, value } => {
                self.stats.telemetry = self.stats.telemetry.wrapping_add(1);
                if let Err(e) = self.telemetry.update(&name, value, "", now) {
                    debug!("telemetry '{}' not mirrored: {}", name, e);
                }
                None
            }
            Message::Command(command) => {
                self.apply_command(command);
                None
            }
            Message::SettingSet(setting) => match setting.check_bounds() {
                Ok(()) => {
                    self.settings.assign(setting);
                    self.stats.settings_applied = self.stats.settings_applied.wrapping_add(1);
                    Some(Message::SettingAck(setting))
                }
                Err(e) => {
                    self.stats.settings_rejected = self.stats.settings_rejected.wrapping_add(1);
                    warn!("refusing {}: {}", setting, e);
                    None
                }
            },
            Message::PatternSelect(n) if n < PATTERN_COUNT => {
                self.settings.pattern = n;
                Some(Message::PatternOk(n))
            }
            Message::PatternSelect(n) => {
                warn!("unknown pattern {}", n);
                None
            }
            Message::PatternQuery => Some(Message::PatternOk(self.settings.pattern)),
            Message::Ping => Some(Message::Pong),
            Message::Unparseable(reason) => {
                self.stats.parse_errors = self.stats.parse_errors.wrapping_add(1);
                self.last_parse_error = Some(reason);
                None
            }
            _ => None,
        }
    }

    fn apply_command(&mut self, command: Command) {
        self.stats.commands = self.stats.commands.wrapping_add(1);
        match command {
            Command::Screen(n) => self.screen = n,
            Command::Dim(on) => self.dim = on,
            Command::Mute(on) => self.mute = on,
        }
    }

    /// Request for a change made on this unit's own controls. Only values
    /// within bounds are forwarded; the hub decides and broadcasts.
    pub fn local_setting(&self, setting: Setting) -> Option<Message> {
        setting.check_bounds().ok()?;
        Some(Message::SettingSet(setting))
    }

    /// Drop everything back to defaults and return the line announcing it.
    pub fn reboot(&mut self) -> Message {
        info!("peripheral reboot, mirror cleared");
        *self = Self::new();
        Message::Reset
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn telemetry(&self) -> &Snapshot {
        &self.telemetry
    }

    pub fn value(&self, name: &str, now: u64) -> Option<f32> {
        self.telemetry.value(name, now)
    }

    pub fn screen(&self) -> u8 {
        self.screen
    }

    pub fn is_dimmed(&self) -> bool {
        self.dim
    }

    pub fn is_muted(&self) -> bool {
        self.mute
    }

    pub fn last_parse_error(&self) -> Option<ParseError> {
        self.last_parse_error
    }

    pub fn stats(&self) -> &MirrorStats {
        &self.stats
    }
}

impl Default for PeripheralMirror {
    fn default() -> Self {
        Self::new()
    }
}
