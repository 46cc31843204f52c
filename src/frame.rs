//! Vehicle bus frames.
//!
//! [`Frame`] is the unit handed from a bus interface to the decoder. It
//! implements [`embedded_can::Frame`] so any HAL that speaks that trait can
//! construct one, and it can be parsed from `candump -l` log lines for replay.

use arrayvec::ArrayString;
use embedded_can::{ExtendedId, Id, StandardId};
use heapless::Vec;
use serde::Serialize;
use thiserror::Error;

pub const MAX_FRAME_DATA: usize = 8;
pub const MAX_INTERFACE_NAME: usize = 16;

/// Logical bus index (0 = powertrain, 1 = body, ...).
pub type BusId = u8;

pub type FrameData = Vec<u8, MAX_FRAME_DATA>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FrameId {
    Standard(u16),
    Extended(u32),
}

impl FrameId {
    pub const fn raw(self) -> u32 {
        match self {
            FrameId::Standard(id) => id as u32,
            FrameId::Extended(id) => id,
        }
    }

    pub const fn is_extended(self) -> bool {
        matches!(self, FrameId::Extended(_))
    }

    pub fn to_id(self) -> Option<Id> {
        match self {
            FrameId::Standard(raw) => StandardId::new(raw).map(Id::Standard),
            FrameId::Extended(raw) => ExtendedId::new(raw).map(Id::Extended),
        }
    }
}

impl From<Id> for FrameId {
    fn from(id: Id) -> Self {
        match id {
            Id::Standard(id) => FrameId::Standard(id.as_raw()),
            Id::Extended(id) => FrameId::Extended(id.as_raw()),
        }
    }
}

impl core::fmt::Display for FrameId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameId::Standard(id) => write!(f, "{:03X}", id),
            FrameId::Extended(id) => write!(f, "{:08X}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bus: BusId,
    id: Id,
    remote: bool,
    dlc: usize,
    data: FrameData,
}

impl Frame {
    /// Data frame on an explicit bus. Returns `None` for payloads over 8 bytes.
    pub fn on_bus(bus: BusId, id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let data = Vec::from_slice(data).ok()?;
        Some(Self {
            bus,
            id: id.into(),
            remote: false,
            dlc: data.len(),
            data,
        })
    }

    /// Convenience constructor for standard ids, mostly for tests and tooling.
    pub fn standard(bus: BusId, raw_id: u16, data: &[u8]) -> Option<Self> {
        Self::on_bus(bus, StandardId::new(raw_id)?, data)
    }

    pub fn bus(&self) -> BusId {
        self.bus
    }

    pub fn with_bus(mut self, bus: BusId) -> Self {
        self.bus = bus;
        self
    }

    pub fn frame_id(&self) -> FrameId {
        FrameId::from(self.id)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Parses one line of `candump -l` output:
    /// `(1620000000.123456) can0 201#1F40000000000000`.
    ///
    /// The bus index is taken from the trailing digits of the interface name.
    pub fn from_candump(line: &str) -> Result<LoggedFrame, FrameError> {
        let mut parts = line.split_whitespace();

        let stamp = parts.next().ok_or(FrameError::MissingTimestamp)?;
        let stamp = stamp
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or(FrameError::BadTimestamp)?;
        let timestamp_us = parse_timestamp_us(stamp)?;

        let iface = parts.next().ok_or(FrameError::MissingInterface)?;
        let interface =
            ArrayString::from(iface).map_err(|_| FrameError::InterfaceNameTooLong)?;
        let bus = iface
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse::<BusId>()
            .unwrap_or(0);

        let body = parts.next().ok_or(FrameError::MissingBody)?;
        let (id_text, data_text) = body.split_once('#').ok_or(FrameError::MissingBody)?;
        let id = parse_id(id_text)?;

        let frame = if let Some(dlc) = data_text.strip_prefix('R') {
            let dlc = if dlc.is_empty() {
                0
            } else {
                dlc.parse::<usize>().map_err(|_| FrameError::BadData)?
            };
            <Frame as embedded_can::Frame>::new_remote(id, dlc).ok_or(FrameError::TooLong)?
        } else {
            let data = parse_hex_bytes(data_text)?;
            Frame::on_bus(bus, id, &data).ok_or(FrameError::TooLong)?
        };

        Ok(LoggedFrame {
            timestamp_us,
            interface,
            frame: frame.with_bus(bus),
        })
    }
}

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::on_bus(0, id, data)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > MAX_FRAME_DATA {
            return None;
        }
        Some(Self {
            bus: 0,
            id: id.into(),
            remote: true,
            dlc,
            data: Vec::new(),
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A frame read back from a candump log, with its capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedFrame {
    pub timestamp_us: u64,
    pub interface: ArrayString<MAX_INTERFACE_NAME>,
    pub frame: Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("malformed timestamp")]
    BadTimestamp,
    #[error("missing interface name")]
    MissingInterface,
    #[error("interface name too long")]
    InterfaceNameTooLong,
    #[error("missing id#data body")]
    MissingBody,
    #[error("invalid frame id")]
    BadId,
    #[error("invalid payload hex")]
    BadData,
    #[error("payload longer than 8 bytes")]
    TooLong,
}

fn parse_timestamp_us(text: &str) -> Result<u64, FrameError> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, "0"));
    let secs = secs.parse::<u64>().map_err(|_| FrameError::BadTimestamp)?;
    if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::BadTimestamp);
    }
    let mut micros = frac.parse::<u64>().map_err(|_| FrameError::BadTimestamp)?;
    for _ in frac.len()..6 {
        micros *= 10;
    }
    secs.checked_mul(1_000_000)
        .and_then(|us| us.checked_add(micros))
        .ok_or(FrameError::BadTimestamp)
}

fn parse_id(text: &str) -> Result<Id, FrameError> {
    let raw = u32::from_str_radix(text, 16).map_err(|_| FrameError::BadId)?;
    // candump writes 3 hex digits for standard ids and 8 for extended ones
    if text.len() <= 3 {
        let raw = u16::try_from(raw).map_err(|_| FrameError::BadId)?;
        StandardId::new(raw).map(Id::Standard).ok_or(FrameError::BadId)
    } else {
        ExtendedId::new(raw).map(Id::Extended).ok_or(FrameError::BadId)
    }
}

fn parse_hex_bytes(text: &str) -> Result<FrameData, FrameError> {
    let text = text.as_bytes();
    if text.len() % 2 != 0 {
        return Err(FrameError::BadData);
    }
    let mut out = FrameData::new();
    for pair in text.chunks(2) {
        let pair = core::str::from_utf8(pair).map_err(|_| FrameError::BadData)?;
        let byte = u8::from_str_radix(pair, 16).map_err(|_| FrameError::BadData)?;
        out.push(byte).map_err(|_| FrameError::TooLong)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::Frame as _;

    #[test]
    fn test_candump_standard_frame() {
        let logged = Frame::from_candump("(1620000000.250000) can1 201#1F40000000000000").unwrap();
        assert_eq!(logged.timestamp_us, 1_620_000_000_250_000);
        assert_eq!(logged.interface.as_str(), "can1");
        assert_eq!(logged.frame.bus(), 1);
        assert_eq!(logged.frame.frame_id(), FrameId::Standard(0x201));
        assert_eq!(logged.frame.payload(), &[0x1F, 0x40, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_candump_extended_and_remote() {
        let logged = Frame::from_candump("(1.5) vcan0 18FEF100#0102").unwrap();
        assert_eq!(logged.timestamp_us, 1_500_000);
        assert!(logged.frame.is_extended());
        assert_eq!(logged.frame.frame_id(), FrameId::Extended(0x18FE_F100));

        let remote = Frame::from_candump("(2.000001) can0 123#R4").unwrap();
        assert!(remote.frame.is_remote_frame());
        assert_eq!(remote.frame.dlc(), 4);
        assert!(remote.frame.payload().is_empty());
    }

    #[test]
    fn test_candump_rejects_garbage() {
        assert_eq!(Frame::from_candump(""), Err(FrameError::MissingTimestamp));
        assert_eq!(Frame::from_candump("(x) can0 201#00"), Err(FrameError::BadTimestamp));
        assert_eq!(
            Frame::from_candump("(99999999999999999.0) can0 201#1F40"),
            Err(FrameError::BadTimestamp)
        );
        assert_eq!(Frame::from_candump("(1.0) can0 201"), Err(FrameError::MissingBody));
        assert_eq!(Frame::from_candump("(1.0) can0 8FF#00"), Err(FrameError::BadId));
        assert_eq!(Frame::from_candump("(1.0) can0 201#0"), Err(FrameError::BadData));
        assert_eq!(
            Frame::from_candump("(1.0) can0 201#000000000000000000"),
            Err(FrameError::TooLong)
        );
    }
}
