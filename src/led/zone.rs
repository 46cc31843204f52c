use crate::settings::{Settings, DEFAULT_REDLINE_RPM, DEFAULT_SHIFT_RPM, SHIFT_RPM_MIN};
use serde::Serialize;

/// Below this the strip stays dark.
pub const DISPLAY_MIN_RPM: u16 = 400;
/// Upper edge of the stall band.
pub const STALL_MAX_RPM: u16 = 1500;
/// Vehicle counts as moving strictly above this speed.
pub const MOVING_SPEED_KMH: f32 = 5.0;

static_assertions::const_assert!(DISPLAY_MIN_RPM < STALL_MAX_RPM);
static_assertions::const_assert!(STALL_MAX_RPM < SHIFT_RPM_MIN);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Zone {
    Off,
    StallWarning,
    EfficiencyBar,
    ShiftWarning,
}

/// Band edges in rpm. Every band is half-open, `[lower, upper)`, so an edge
/// value belongs to the band above it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneBands {
    pub display_min: f32,
    pub stall_max: f32,
    pub moving_kmh: f32,
    pub shift: f32,
    pub limit: f32,
}

impl ZoneBands {
    pub fn new(shift_rpm: u16, redline_rpm: u16) -> Self {
        Self {
            display_min: f32::from(DISPLAY_MIN_RPM),
            stall_max: f32::from(STALL_MAX_RPM),
            moving_kmh: MOVING_SPEED_KMH,
            shift: f32::from(shift_rpm),
            limit: f32::from(redline_rpm.max(shift_rpm)),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.shift_rpm, settings.redline_rpm)
    }

    pub fn is_ordered(&self) -> bool {
        self.display_min < self.stall_max && self.stall_max < self.shift && self.shift <= self.limit
    }

    /// Zone for one reading. `speed` is `None` when unknown, which never
    /// counts as moving.
    pub fn classify(&self, rpm: f32, speed: Option<f32>) -> Zone {
        if rpm.is_nan() || rpm < self.display_min {
            return Zone::Off;
        }
        if rpm >= self.shift {
            return Zone::ShiftWarning;
        }
        if rpm >= self.stall_max {
            return Zone::EfficiencyBar;
        }
        let moving = speed.is_some_and(|s| s > self.moving_kmh);
        if moving {
            Zone::StallWarning
        } else {
            Zone::Off
        }
    }

    /// How far through the efficiency band `rpm` is, 0.0 to 1.0.
    pub fn efficiency_fraction(&self, rpm: f32) -> f32 {
        fraction(rpm, self.stall_max, self.shift)
    }

    /// How far from the shift point to the limit `rpm` is, 0.0 to 1.0.
    pub fn shift_fraction(&self, rpm: f32) -> f32 {
        fraction(rpm, self.shift, self.limit)
    }
}

impl Default for ZoneBands {
    fn default() -> Self {
        Self::new(DEFAULT_SHIFT_RPM, DEFAULT_REDLINE_RPM)
    }
}

fn fraction(value: f32, lower: f32, upper: f32) -> f32 {
    if upper <= lower {
        return if value >= upper { 1.0 } else { 0.0 };
    }
    ((value - lower) / (upper - lower)).clamp(0.0, 1.0)
}

pub fn classify(bands: &ZoneBands, rpm: f32, speed: Option<f32>) -> Zone {
    bands.classify(rpm, speed)
}
