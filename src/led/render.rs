//! Turns a zone and an rpm reading into one frame of LED colors.

use super::color::{self, ColorRamp, AMBER, BLACK, RED};
use super::zone::{Zone, ZoneBands};
use heapless::Vec;
use rgb::RGB8;
use serde::Serialize;

pub const DEFAULT_LED_COUNT: usize = 16;
pub const MAX_LEDS: usize = 32;

/// Lowest level a partially lit boundary LED is shown at.
pub const MIN_VISIBLE: f32 = 0.08;

pub const STALL_PULSE_PERIOD_MS: u64 = 600;
pub const FAULT_BLINK_PERIOD_MS: u64 = 1000;
const FAULT_MIN_LEVEL: f32 = 0.25;

const SHIFT_BACKGROUND_LEVEL: f32 = 0.15;
/// Marker sweep speed in LEDs per second at the shift point and at the limit.
const SWEEP_BASE_LEDS_PER_S: f32 = 12.0;
const SWEEP_MAX_LEDS_PER_S: f32 = 60.0;

pub type LedFrame = Vec<RGB8, MAX_LEDS>;
pub type Levels = Vec<f32, MAX_LEDS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Pattern {
    /// Two bars growing from the ends toward the center.
    OutsideIn,
    /// Two bars growing from the center toward the ends.
    InsideOut,
    /// One bar over the whole strip.
    LeftToRight,
}

impl Pattern {
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Pattern::OutsideIn),
            1 => Some(Pattern::InsideOut),
            2 => Some(Pattern::LeftToRight),
            _ => None,
        }
    }

    pub const fn id(self) -> u8 {
        match self {
            Pattern::OutsideIn => 0,
            Pattern::InsideOut => 1,
            Pattern::LeftToRight => 2,
        }
    }

    const fn is_mirrored(self) -> bool {
        !matches!(self, Pattern::LeftToRight)
    }
}

static_assertions::const_assert_eq!(crate::settings::PATTERN_COUNT, 3);

/// Level of the LED a bar ends on, given the fractional part of the bar
/// length. A non-zero remainder is never shown darker than [`MIN_VISIBLE`].
pub fn boundary_level(remainder: f32) -> f32 {
    if remainder <= 0.0 || remainder.is_nan() {
        0.0
    } else {
        remainder.clamp(MIN_VISIBLE, 1.0)
    }
}

/// Per-LED levels for a bar `length` LEDs long over `count` LEDs.
#[allow(clippy::cast_precision_loss)]
pub fn bar_levels(length: f32, count: usize) -> Levels {
    let count = count.min(MAX_LEDS);
    let length = length.clamp(0.0, count as f32);
    let whole = length.floor();
    let remainder = length - whole;
    let lit = whole as usize;

    let mut levels = Levels::new();
    for i in 0..count {
        let level = match i.cmp(&lit) {
            core::cmp::Ordering::Less => 1.0,
            core::cmp::Ordering::Equal => boundary_level(remainder),
            core::cmp::Ordering::Greater => 0.0,
        };
        // count is capped at capacity
        let _ = levels.push(level);
    }
    levels
}

/// Raised-cosine pulse: 0.0 at the start of each period, 1.0 halfway.
#[allow(clippy::cast_precision_loss)]
pub fn pulse_level(now: u64, period_ms: u64) -> f32 {
    if period_ms == 0 {
        return 1.0;
    }
    let phase = (now % period_ms) as f32 / period_ms as f32;
    0.5 - 0.5 * (core::f32::consts::TAU * phase).cos()
}

#[derive(Debug, Clone)]
pub struct Renderer {
    count: usize,
    pattern: Pattern,
    brightness: f32,
    sweep_phase: f32,
    last_render_at: Option<u64>,
}

impl Renderer {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.clamp(1, MAX_LEDS),
            pattern: Pattern::OutsideIn,
            brightness: 1.0,
            sweep_phase: 0.0,
            last_render_at: None,
        }
    }

    pub fn set_pattern(&mut self, pattern: Pattern) {
        self.pattern = pattern;
    }

    /// Brightness in percent; values above 100 are treated as 100.
    pub fn set_brightness(&mut self, percent: u8) {
        self.brightness = f32::from(percent.min(100)) / 100.0;
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn led_count(&self) -> usize {
        self.count
    }

    /// Bar length on each side for mirrored patterns, or over the whole
    /// strip for the single-bar pattern.
    #[allow(clippy::cast_precision_loss)]
    pub fn bar_length(&self, fraction: f32) -> f32 {
        let span = if self.pattern.is_mirrored() {
            self.count as f32 / 2.0
        } else {
            self.count as f32
        };
        fraction.clamp(0.0, 1.0) * span
    }

    /// Levels for the efficiency bar at `fraction` (0.0 to 1.0), laid out
    /// in strip order for the current pattern.
    pub fn efficiency_levels(&self, fraction: f32) -> Levels {
        let length = self.bar_length(fraction);
        if !self.pattern.is_mirrored() {
            return bar_levels(length, self.count);
        }

        let side = self.count.div_ceil(2);
        let bar = bar_levels(length, side);
        let mut levels = Levels::new();
        for _ in 0..self.count {
            let _ = levels.push(0.0);
        }
        for (step, level) in bar.iter().enumerate() {
            let (left, right) = self.mirrored_pair(step);
            levels[left] = levels[left].max(*level);
            levels[right] = levels[right].max(*level);
        }
        levels
    }

    /// The two strip positions `step` LEDs into a mirrored bar.
    fn mirrored_pair(&self, step: usize) -> (usize, usize) {
        let last = self.count - 1;
        match self.pattern {
            Pattern::InsideOut => {
                let center_left = last / 2;
                let center_right = self.count / 2;
                (center_left.saturating_sub(step), (center_right + step).min(last))
            }
            _ => (step.min(last), last.saturating_sub(step)),
        }
    }

    /// Render one frame.
    pub fn render(&mut self, zone: Zone, rpm: f32, bands: &ZoneBands, ramp: &ColorRamp, now: u64) -> LedFrame {
        let dt_ms = self.last_render_at.map_or(0, |at| now.saturating_sub(at));
        self.last_render_at = Some(now);

        let frame = match zone {
            Zone::Off => self.fill(BLACK),
            Zone::StallWarning => self.stall(now),
            Zone::EfficiencyBar => {
                let levels = self.efficiency_levels(bands.efficiency_fraction(rpm));
                let color = ramp.color_at(rpm);
                levels.iter().map(|l| color::scale(color, *l)).collect()
            }
            Zone::ShiftWarning => self.shift(bands.shift_fraction(rpm), dt_ms),
        };
        if zone != Zone::ShiftWarning {
            self.sweep_phase = 0.0;
        }
        self.dim(frame, self.brightness)
    }

    /// Slow amber blink at both ends of the strip.
    pub fn render_fault(&mut self, now: u64) -> LedFrame {
        self.last_render_at = Some(now);
        self.sweep_phase = 0.0;
        let mut frame = self.fill(BLACK);
        if now % FAULT_BLINK_PERIOD_MS < FAULT_BLINK_PERIOD_MS / 2 {
            let last = self.count - 1;
            frame[0] = AMBER;
            frame[last] = AMBER;
        }
        self.dim(frame, self.brightness.max(FAULT_MIN_LEVEL))
    }

    fn stall(&self, now: u64) -> LedFrame {
        let level = pulse_level(now, STALL_PULSE_PERIOD_MS);
        let mut frame = self.fill(BLACK);
        let quarter = self.count / 4;
        let last = self.count - 1;
        frame[quarter] = color::scale(AMBER, level);
        frame[last - quarter] = color::scale(AMBER, level);
        frame
    }

    #[allow(clippy::cast_precision_loss)]
    fn shift(&mut self, fraction: f32, dt_ms: u64) -> LedFrame {
        let speed = SWEEP_BASE_LEDS_PER_S + (SWEEP_MAX_LEDS_PER_S - SWEEP_BASE_LEDS_PER_S) * fraction;
        let span = if self.pattern.is_mirrored() {
            self.count.div_ceil(2)
        } else {
            self.count
        };
        let span_f = span as f32;
        self.sweep_phase = (self.sweep_phase + speed * dt_ms as f32 / 1000.0) % span_f;

        let mut frame = self.fill(color::scale(RED, SHIFT_BACKGROUND_LEVEL));
        let step = (self.sweep_phase as usize).min(span - 1);
        if self.pattern.is_mirrored() {
            let (left, right) = self.mirrored_pair(step);
            frame[left] = RED;
            frame[right] = RED;
        } else {
            frame[step] = RED;
        }
        frame
    }

    fn fill(&self, color: RGB8) -> LedFrame {
        let mut frame = LedFrame::new();
        for _ in 0..self.count {
            let _ = frame.push(color);
        }
        frame
    }

    fn dim(&self, frame: LedFrame, level: f32) -> LedFrame {
        frame.iter().map(|c| color::scale(*c, level)).collect()
    }

    /// Current marker position along the sweep, in LEDs.
    pub fn sweep_phase(&self) -> f32 {
        self.sweep_phase
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(DEFAULT_LED_COUNT)
    }
}
