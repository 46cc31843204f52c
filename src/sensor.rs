//! Wireless tire-pressure sensors, scanned from the display unit and
//! forwarded to the hub as telemetry.

use crate::protocol::Message;
use alloc::vec::Vec as AllocVec;
use core::fmt::Write;
use heapless::Vec;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TPMS_PAYLOAD_LEN: usize = 18;
/// Sensor ids come from a 4-bit field.
pub const MAX_SENSORS: usize = 16;
pub const MAX_ADVERT_LEN: usize = 31;

pub const DEFAULT_SCAN_WINDOW_MS: u64 = 300;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_SENSOR_STALE_MS: u64 = 30_000;
const MAX_ADVERTS_PER_POLL: usize = 16;

pub type Advert = Vec<u8, MAX_ADVERT_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("tpms payload is {0} bytes, expected {}", TPMS_PAYLOAD_LEN)]
    WrongLength(usize),
}

/// One decoded sensor payload.
///
/// Layout, little-endian: `company u16 | addr[6] | pressure_pa u32 |
/// temp_centi_c i32 | battery_pct u8 | alarm u8`. The sensor position is the
/// low nibble of the first address byte.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TpmsReading {
    pub id: u8,
    pub address: [u8; 6],
    pub pressure_pa: u32,
    pub temperature_c: f32,
    pub battery_pct: u8,
    pub alarm: bool,
}

impl TpmsReading {
    pub fn decode(bytes: &[u8]) -> Result<Self, SensorError> {
        let bytes: &[u8; TPMS_PAYLOAD_LEN] = bytes
            .try_into()
            .map_err(|_| SensorError::WrongLength(bytes.len()))?;

        let mut address = [0u8; 6];
        address.copy_from_slice(&bytes[2..8]);
        let pressure_pa = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let temp_centi = i32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        #[allow(clippy::cast_precision_loss)]
        let temperature_c = temp_centi as f32 / 100.0;

        Ok(Self {
            id: address[0] & 0x0F,
            address,
            pressure_pa,
            temperature_c,
            battery_pct: bytes[16],
            alarm: bytes[17] != 0,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn pressure_kpa(&self) -> f32 {
        self.pressure_pa as f32 / 1000.0
    }
}

/// A radio that can run a bounded scan for sensor advertisements.
pub trait SensorScanner {
    type Error: core::fmt::Debug;

    fn start_scan(&mut self) -> Result<(), Self::Error>;

    /// Next advertisement payload heard, `WouldBlock` when none is pending.
    fn next_advert(&mut self) -> nb::Result<Advert, Self::Error>;

    fn stop_scan(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct ForwarderConfig {
    pub scan_window_ms: u64,
    pub scan_interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: DEFAULT_SCAN_WINDOW_MS,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            stale_after_ms: DEFAULT_SENSOR_STALE_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ForwarderStats {
    pub scans: u32,
    pub scan_failures: u32,
    pub adverts: u32,
    pub decode_errors: u32,
    pub forwarded: u32,
}

/// What the display shows for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorView {
    pub reading: TpmsReading,
    pub seen_at: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Idle { next_at: u64 },
    Scanning { until: u64 },
}

pub struct SensorForwarder<S: SensorScanner> {
    scanner: S,
    config: ForwarderConfig,
    state: ScanState,
    cache: [Option<(TpmsReading, u64)>; MAX_SENSORS],
    seen: u16,
    stats: ForwarderStats,
}

impl<S: SensorScanner> SensorForwarder<S> {
    pub fn new(scanner: S, config: ForwarderConfig) -> Self {
        Self {
            scanner,
            config,
            state: ScanState::Idle { next_at: 0 },
            cache: [None; MAX_SENSORS],
            seen: 0,
            stats: ForwarderStats::default(),
        }
    }

    /// Advance the scan cycle. Returns the telemetry to send to the hub,
    /// which is non-empty only when a scan window has just closed.
    pub fn poll(&mut self, now: u64) -> AllocVec<Message> {
        match self.state {
            ScanState::Idle { next_at } if now >= next_at => {
                self.start(now);
                AllocVec::new()
            }
            ScanState::Idle { .. } => AllocVec::new(),
            ScanState::Scanning { until } => {
                self.drain(now);
                if now >= until {
                    self.finish(now)
                } else {
                    AllocVec::new()
                }
            }
        }
    }

    fn start(&mut self, now: u64) {
        self.stats.scans = self.stats.scans.wrapping_add(1);
        self.seen = 0;
        match self.scanner.start_scan() {
            Ok(()) => {
                debug!("sensor scan started for {} ms", self.config.scan_window_ms);
                self.state = ScanState::Scanning { until: now + self.config.scan_window_ms };
            }
            Err(e) => {
                self.stats.scan_failures = self.stats.scan_failures.wrapping_add(1);
                warn!("sensor scan failed to start: {:?}", e);
                self.state = ScanState::Idle { next_at: now + self.config.scan_interval_ms };
            }
        }
    }

    fn drain(&mut self, now: u64) {
        for _ in 0..MAX_ADVERTS_PER_POLL {
            let advert = match self.scanner.next_advert() {
                Ok(advert) => advert,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    debug!("sensor scan error: {:?}", e);
                    break;
                }
            };
            self.stats.adverts = self.stats.adverts.wrapping_add(1);
            match TpmsReading::decode(&advert) {
                Ok(reading) => {
                    self.cache[usize::from(reading.id)] = Some((reading, now));
                    self.seen |= 1 << reading.id;
                }
                Err(e) => {
                    self.stats.decode_errors = self.stats.decode_errors.wrapping_add(1);
                    debug!("ignoring advert: {}", e);
                }
            }
        }
    }

    fn finish(&mut self, now: u64) -> AllocVec<Message> {
        if let Err(e) = self.scanner.stop_scan() {
            warn!("sensor scan did not stop cleanly: {:?}", e);
        }
        self.state = ScanState::Idle { next_at: now + self.config.scan_interval_ms };

        let mut out = AllocVec::new();
        for (id, entry) in self.cache.iter().enumerate() {
            let Some((reading, _)) = entry else { continue };
            if self.seen & (1 << id) == 0 {
                continue;
            }
            push_reading(&mut out, reading);
        }
        if !out.is_empty() {
            info!("forwarding {} sensor(s)", self.seen.count_ones());
        }
        self.stats.forwarded = self.stats.forwarded.wrapping_add(self.seen.count_ones());
        out
    }

    /// Last known reading for sensor `id`, flagged stale past the window.
    pub fn view(&self, id: u8, now: u64) -> Option<SensorView> {
        let (reading, seen_at) = (*self.cache.get(usize::from(id))?)?;
        Some(SensorView {
            reading,
            seen_at,
            stale: now.saturating_sub(seen_at) > self.config.stale_after_ms,
        })
    }

    pub fn views(&self, now: u64) -> impl Iterator<Item = SensorView> + '_ {
        (0..MAX_SENSORS as u8).filter_map(move |id| self.view(id, now))
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self.state, ScanState::Scanning { .. })
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    pub fn scanner_mut(&mut self) -> &mut S {
        &mut self.scanner
    }
}

fn push_reading(out: &mut AllocVec<Message>, reading: &TpmsReading) {
    let fields = [
        ("kpa", reading.pressure_kpa()),
        ("temp", reading.temperature_c),
        ("batt", f32::from(reading.battery_pct)),
    ];
    for (suffix, value) in fields {
        let mut name = arrayvec::ArrayString::<16>::new();
        // "tpms15_temp" is the longest name
        let _ = write!(name, "tpms{}_{}", reading.id, suffix);
        match Message::telemetry(&name, value) {
            Ok(message) => out.push(message),
            Err(e) => debug!("cannot forward {}: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_id_is_low_nibble() {
        let mut bytes = [0u8; TPMS_PAYLOAD_LEN];
        bytes[2] = 0x83;
        let reading = TpmsReading::decode(&bytes).unwrap();
        assert_eq!(reading.id, 3);
    }
}
