use super::zone::ZoneBands;
use rgb::RGB8;

pub const GREEN: RGB8 = RGB8 { r: 0, g: 255, b: 0 };
pub const YELLOW: RGB8 = RGB8 { r: 255, g: 220, b: 0 };
pub const ORANGE: RGB8 = RGB8 { r: 255, g: 110, b: 0 };
pub const RED: RGB8 = RGB8 { r: 255, g: 0, b: 0 };
pub const AMBER: RGB8 = RGB8 { r: 255, g: 150, b: 0 };
pub const BLACK: RGB8 = RGB8 { r: 0, g: 0, b: 0 };

/// Orange sits this many rpm below the shift point, unless that would put
/// it below the yellow midpoint.
const ORANGE_LEAD_RPM: f32 = 250.0;

/// Piecewise-linear gradient over rpm. Stops are sorted by rpm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorRamp {
    stops: [(f32, RGB8); 4],
}

impl ColorRamp {
    pub fn new(stops: [(f32, RGB8); 4]) -> Self {
        Self { stops }
    }

    /// Green at the stall edge, yellow halfway to shift, orange just below
    /// shift, red from the shift point up.
    pub fn for_bands(bands: &ZoneBands) -> Self {
        let mid = (bands.stall_max + bands.shift) / 2.0;
        let orange = (bands.shift - ORANGE_LEAD_RPM).max(mid);
        Self::new([
            (bands.stall_max, GREEN),
            (mid, YELLOW),
            (orange, ORANGE),
            (bands.shift, RED),
        ])
    }

    pub fn color_at(&self, rpm: f32) -> RGB8 {
        let (first_rpm, first) = self.stops[0];
        if rpm.is_nan() || rpm <= first_rpm {
            return first;
        }
        for pair in self.stops.windows(2) {
            let (lo_rpm, lo) = pair[0];
            let (hi_rpm, hi) = pair[1];
            if rpm <= hi_rpm {
                let span = hi_rpm - lo_rpm;
                let t = if span > 0.0 { (rpm - lo_rpm) / span } else { 1.0 };
                return lerp(lo, hi, t);
            }
        }
        self.stops[self.stops.len() - 1].1
    }
}

impl Default for ColorRamp {
    fn default() -> Self {
        Self::for_bands(&ZoneBands::default())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    let a = f32::from(a);
    let b = f32::from(b);
    (a + (b - a) * t).round().clamp(0.0, 255.0) as u8
}

pub fn lerp(a: RGB8, b: RGB8, t: f32) -> RGB8 {
    let t = t.clamp(0.0, 1.0);
    RGB8::new(lerp_u8(a.r, b.r, t), lerp_u8(a.g, b.g, t), lerp_u8(a.b, b.b, t))
}

/// `color` at `level` (0.0 to 1.0) of full intensity.
pub fn scale(color: RGB8, level: f32) -> RGB8 {
    lerp(BLACK, color, level)
}
