use super::color::ColorRamp;
use super::render::{LedFrame, Pattern, Renderer, DEFAULT_LED_COUNT};
use super::zone::{Zone, ZoneBands};
use crate::decoder::Decoder;
use crate::listener::{BusListener, ListenerConfig, PassiveBus};
use crate::peripheral::PeripheralMirror;
use crate::protocol::Message;
use crate::rules::{LED_TAP_RULES, POWERTRAIN_BUS, RPM_SIGNAL, SPEED_SIGNAL};
use crate::settings::Settings;
use crate::snapshot::Snapshot;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_MS: u64 = 5;
/// The tap is read every few milliseconds, so it goes stale much sooner
/// than the hub's snapshot.
pub const DEFAULT_TAP_STALE_AFTER_MS: u64 = 250;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub led_count: usize,
    pub tick_ms: u64,
    pub tap_stale_after_ms: u64,
    pub listener: ListenerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            led_count: DEFAULT_LED_COUNT,
            tick_ms: DEFAULT_TICK_MS,
            tap_stale_after_ms: DEFAULT_TAP_STALE_AFTER_MS,
            listener: ListenerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub zone_changes: u32,
    pub fault_entries: u32,
}

/// Shift-light state machine fed by its own bus tap.
pub struct RpmLightEngine<B: PassiveBus> {
    tap: BusListener<B>,
    signals: Snapshot,
    bands: ZoneBands,
    ramp: ColorRamp,
    renderer: Renderer,
    config: EngineConfig,
    zone: Zone,
    faulted: bool,
    last_tick_at: Option<u64>,
    frame: LedFrame,
    stats: EngineStats,
}

impl<B: PassiveBus> RpmLightEngine<B> {
    pub fn new(bus: B, config: EngineConfig) -> Self {
        let decoder = Decoder::new(&LED_TAP_RULES);
        let tap = BusListener::new(bus, decoder, POWERTRAIN_BUS, config.listener);
        let bands = ZoneBands::default();
        Self {
            tap,
            signals: Snapshot::with_stale_after(config.tap_stale_after_ms),
            ramp: ColorRamp::for_bands(&bands),
            bands,
            renderer: Renderer::new(config.led_count),
            config,
            zone: Zone::Off,
            faulted: false,
            last_tick_at: None,
            frame: LedFrame::new(),
            stats: EngineStats::default(),
        }
    }

    /// Pick up brightness, shift point, redline and pattern.
    pub fn apply_settings(&mut self, settings: &Settings) {
        let bands = ZoneBands::from_settings(settings);
        if bands != self.bands {
            if bands.is_ordered() {
                self.ramp = ColorRamp::for_bands(&bands);
                self.bands = bands;
            } else {
                warn!("ignoring unordered rpm bands {:?}", bands);
            }
        }
        self.renderer.set_brightness(settings.brightness);
        match Pattern::from_id(settings.pattern) {
            Some(pattern) => self.renderer.set_pattern(pattern),
            None => debug!("unknown pattern {}, keeping {:?}", settings.pattern, self.renderer.pattern()),
        }
    }

    /// Run one step if a tick is due. Returns the new frame when one was
    /// rendered.
    pub fn tick(&mut self, now: u64) -> Option<&LedFrame> {
        if let Some(at) = self.last_tick_at {
            if now.saturating_sub(at) < self.config.tick_ms {
                return None;
            }
        }
        self.last_tick_at = Some(now);
        self.stats.ticks = self.stats.ticks.wrapping_add(1);

        self.tap.poll(&mut self.signals, now);

        let rpm = self.signals.value(RPM_SIGNAL, now);
        let speed = self.signals.value(SPEED_SIGNAL, now);

        self.frame = match rpm {
            None => {
                if !self.faulted {
                    self.faulted = true;
                    self.stats.fault_entries = self.stats.fault_entries.wrapping_add(1);
                    warn!("no fresh rpm on the tap, showing fault pattern");
                }
                self.renderer.render_fault(now)
            }
            Some(rpm) => {
                if self.faulted {
                    self.faulted = false;
                    info!("rpm back on the tap");
                }
                let zone = self.bands.classify(rpm, speed);
                if zone != self.zone {
                    debug!("zone {:?} -> {:?} at {} rpm", self.zone, zone, rpm);
                    self.zone = zone;
                    self.stats.zone_changes = self.stats.zone_changes.wrapping_add(1);
                }
                self.renderer.render(zone, rpm, &self.bands, &self.ramp, now)
            }
        };
        Some(&self.frame)
    }

    /// Zone for a reading under the current bands, without touching state.
    pub fn evaluate(&self, rpm: f32, speed: Option<f32>) -> Zone {
        self.bands.classify(rpm, speed)
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn frame(&self) -> &LedFrame {
        &self.frame
    }

    pub fn bands(&self) -> &ZoneBands {
        &self.bands
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn tap(&self) -> &BusListener<B> {
        &self.tap
    }

    pub fn tap_mut(&mut self) -> &mut BusListener<B> {
        &mut self.tap
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

/// The LED peripheral: light engine plus its end of the hub link.
pub struct LedUnit<B: PassiveBus> {
    engine: RpmLightEngine<B>,
    mirror: PeripheralMirror,
}

impl<B: PassiveBus> LedUnit<B> {
    pub fn new(bus: B, config: EngineConfig) -> Self {
        let mirror = PeripheralMirror::new();
        let mut engine = RpmLightEngine::new(bus, config);
        engine.apply_settings(mirror.settings());
        Self { engine, mirror }
    }

    /// Line announcing this unit to the hub after power-up.
    pub fn boot(&mut self) -> Message {
        let reset = self.mirror.reboot();
        self.engine.apply_settings(self.mirror.settings());
        reset
    }

    /// Handle a line from the hub; settings take effect immediately.
    pub fn handle_line(&mut self, line: &str, now: u64) -> Option<Message> {
        let reply = self.mirror.handle_line(line, now);
        self.engine.apply_settings(self.mirror.settings());
        reply
    }

    pub fn tick(&mut self, now: u64) -> Option<&LedFrame> {
        self.engine.tick(now)
    }

    pub fn engine(&self) -> &RpmLightEngine<B> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut RpmLightEngine<B> {
        &mut self.engine
    }

    pub fn mirror(&self) -> &PeripheralMirror {
        &self.mirror
    }
}
