//! Vehicle schema: decode rules and bus signatures.
//!
//! Bus 0 is the high-speed powertrain bus, bus 1 the medium-speed body bus.

use crate::decoder::{DecodeRule, Endian, FlagBit};
use crate::frame::{BusId, FrameId};

pub const POWERTRAIN_BUS: BusId = 0;
pub const BODY_BUS: BusId = 1;

pub const ENGINE_FRAME: FrameId = FrameId::Standard(0x201);
pub const TRANSMISSION_FRAME: FrameId = FrameId::Standard(0x231);
pub const BRAKE_FRAME: FrameId = FrameId::Standard(0x212);
pub const VOLTAGE_FRAME: FrameId = FrameId::Standard(0x240);
pub const ENGINE_TEMP_FRAME: FrameId = FrameId::Standard(0x420);
pub const FUEL_FRAME: FrameId = FrameId::Standard(0x430);
pub const TURN_FRAME: FrameId = FrameId::Standard(0x265);
pub const LIGHTS_FRAME: FrameId = FrameId::Standard(0x433);

pub const RPM_SIGNAL: &str = "rpm";
pub const SPEED_SIGNAL: &str = "speed";

pub const RPM_RULE: DecodeRule = DecodeRule::scalar(
    POWERTRAIN_BUS, ENGINE_FRAME, 0, 2, Endian::Big, 0.25, 0.0, RPM_SIGNAL, "rpm",
);

pub const SPEED_RULE: DecodeRule = DecodeRule::scalar(
    POWERTRAIN_BUS, ENGINE_FRAME, 4, 2, Endian::Big, 0.01, -100.0, SPEED_SIGNAL, "km/h",
);

pub const THROTTLE_RULE: DecodeRule = DecodeRule::scalar(
    POWERTRAIN_BUS, ENGINE_FRAME, 6, 1, Endian::Big, 0.5, 0.0, "throttle", "%",
);

static BRAKE_FLAGS: [FlagBit; 2] = [
    FlagBit { mask: 0x40, name: "brake" },
    FlagBit { mask: 0x20, name: "handbrake" },
];

static TURN_FLAGS: [FlagBit; 2] = [
    FlagBit { mask: 0x20, name: "turn_left" },
    FlagBit { mask: 0x40, name: "turn_right" },
];

static LIGHT_FLAGS: [FlagBit; 2] = [
    FlagBit { mask: 0x01, name: "headlights" },
    FlagBit { mask: 0x02, name: "high_beam" },
];

/// Full table used by the hub.
pub static VEHICLE_RULES: [DecodeRule; 12] = [
    RPM_RULE,
    SPEED_RULE,
    THROTTLE_RULE,
    DecodeRule::scalar(POWERTRAIN_BUS, TRANSMISSION_FRAME, 0, 1, Endian::Big, 1.0, 0.0, "gear", "")
        .masked(0xF0, 4),
    DecodeRule::flags(POWERTRAIN_BUS, BRAKE_FRAME, 5, 1, "brake_status", &BRAKE_FLAGS),
    DecodeRule::scalar(POWERTRAIN_BUS, VOLTAGE_FRAME, 0, 2, Endian::Big, 0.001, 0.0, "battery", "V"),
    DecodeRule::scalar(POWERTRAIN_BUS, ENGINE_TEMP_FRAME, 0, 1, Endian::Big, 1.0, -40.0, "coolant_temp", "degC"),
    DecodeRule::scalar(POWERTRAIN_BUS, ENGINE_TEMP_FRAME, 4, 1, Endian::Big, 4.0, 0.0, "oil_pressure", "kPa"),
    DecodeRule::scalar(POWERTRAIN_BUS, ENGINE_TEMP_FRAME, 2, 1, Endian::Big, 1.0, 0.0, "intake_temp", "degC")
        .signed(),
    DecodeRule::scalar(POWERTRAIN_BUS, FUEL_FRAME, 0, 1, Endian::Big, 0.5, 0.0, "fuel_level", "%"),
    DecodeRule::flags(BODY_BUS, TURN_FRAME, 0, 1, "turn_status", &TURN_FLAGS),
    DecodeRule::flags(BODY_BUS, LIGHTS_FRAME, 3, 1, "light_status", &LIGHT_FLAGS),
];

/// Subset decoded by the LED unit's own tap.
pub static LED_TAP_RULES: [DecodeRule; 2] = [RPM_RULE, SPEED_RULE];

/// A frame that only ever appears on one particular bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSignature {
    pub bus: BusId,
    pub frame: FrameId,
}

pub static BUS_SIGNATURES: [BusSignature; 2] = [
    BusSignature { bus: POWERTRAIN_BUS, frame: ENGINE_FRAME },
    BusSignature { bus: BODY_BUS, frame: TURN_FRAME },
];

/// Bus whose signature frame this is, if any.
pub fn identify(signatures: &[BusSignature], frame: FrameId) -> Option<BusId> {
    signatures.iter().find(|s| s.frame == frame).map(|s| s.bus)
}
