//! Data-driven bus decoder.
//!
//! Every vehicle signal is described by a [`DecodeRule`]; the decoder never
//! branches on individual signals. Adding a vehicle means adding a table.

use crate::frame::{BusId, FrameId};
use heapless::Vec;
use tracing::warn;

/// Upper bound on signals produced from a single frame.
pub const MAX_DECODED: usize = 16;

pub type Decoded = Vec<DecodedSignal, MAX_DECODED>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// One bit of a flags byte range and the signal it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagBit {
    pub mask: u32,
    pub name: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleKind {
    /// `raw * scale + offset`
    Scalar,
    /// One 0/1 signal per catalog entry.
    Flags(&'static [FlagBit]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeRule {
    pub bus: BusId,
    pub frame: FrameId,
    pub start: u8,
    /// Number of bytes, 1 to 4.
    pub len: u8,
    pub endian: Endian,
    pub signed: bool,
    pub mask: u32,
    pub shift: u8,
    pub scale: f32,
    pub offset: f32,
    pub name: &'static str,
    pub unit: &'static str,
    pub kind: RuleKind,
}

impl DecodeRule {
    #[allow(clippy::too_many_arguments)]
    pub const fn scalar(
        bus: BusId,
        frame: FrameId,
        start: u8,
        len: u8,
        endian: Endian,
        scale: f32,
        offset: f32,
        name: &'static str,
        unit: &'static str,
    ) -> Self {
        Self {
            bus,
            frame,
            start,
            len,
            endian,
            signed: false,
            mask: u32::MAX,
            shift: 0,
            scale,
            offset,
            name,
            unit,
            kind: RuleKind::Scalar,
        }
    }

    pub const fn flags(
        bus: BusId,
        frame: FrameId,
        start: u8,
        len: u8,
        name: &'static str,
        catalog: &'static [FlagBit],
    ) -> Self {
        Self {
            bus,
            frame,
            start,
            len,
            endian: Endian::Big,
            signed: false,
            mask: u32::MAX,
            shift: 0,
            scale: 1.0,
            offset: 0.0,
            name,
            unit: "",
            kind: RuleKind::Flags(catalog),
        }
    }

    /// Interpret the byte range as two's complement.
    pub const fn signed(self) -> Self {
        Self { signed: true, ..self }
    }

    /// Keep only `mask` bits of the raw value, then shift them down.
    pub const fn masked(self, mask: u32, shift: u8) -> Self {
        Self { mask, shift, ..self }
    }

    pub fn matches(&self, bus: BusId, frame: FrameId) -> bool {
        self.bus == bus && self.frame == frame
    }

    /// Raw integer from the declared byte range, or `None` if the frame is
    /// too short for it.
    pub fn extract_raw(&self, bytes: &[u8]) -> Option<u32> {
        let start = usize::from(self.start);
        let len = usize::from(self.len);
        if len == 0 || len > 4 {
            return None;
        }
        let range = bytes.get(start..start.checked_add(len)?)?;
        let raw = match self.endian {
            Endian::Big => range.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)),
            Endian::Little => range.iter().rev().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)),
        };
        Some(raw)
    }

    fn scaled(&self, raw: u32) -> f32 {
        let bits = (raw & self.mask) >> self.shift;
        let value = if self.signed {
            f64::from(sign_extend(bits, u32::from(self.len) * 8))
        } else {
            f64::from(bits)
        };
        (value * f64::from(self.scale) + f64::from(self.offset)) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSignal {
    pub name: &'static str,
    pub value: f32,
    pub unit: &'static str,
}

/// Decode one frame against `rules` without any logging side effects.
pub fn decode(rules: &[DecodeRule], bus: BusId, frame: FrameId, bytes: &[u8]) -> Decoded {
    let mut out = Decoded::new();
    apply_rules(rules, bus, frame, bytes, &mut out, |_| {});
    out
}

/// Returns `false` if `out` filled up before every rule was applied.
fn apply_rules(
    rules: &[DecodeRule],
    bus: BusId,
    frame: FrameId,
    bytes: &[u8],
    out: &mut Decoded,
    mut on_short: impl FnMut(usize),
) -> bool {
    for (index, rule) in rules.iter().enumerate() {
        if !rule.matches(bus, frame) {
            continue;
        }
        let Some(raw) = rule.extract_raw(bytes) else {
            on_short(index);
            continue;
        };
        match rule.kind {
            RuleKind::Scalar => {
                let signal = DecodedSignal {
                    name: rule.name,
                    value: rule.scaled(raw),
                    unit: rule.unit,
                };
                if out.push(signal).is_err() {
                    return false;
                }
            }
            RuleKind::Flags(catalog) => {
                for bit in catalog {
                    let signal = DecodedSignal {
                        name: bit.name,
                        value: if raw & bit.mask != 0 { 1.0 } else { 0.0 },
                        unit: "",
                    };
                    if out.push(signal).is_err() {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// Decoder bound to a static rule table.
///
/// Keeps just enough state to log each misconfigured rule once instead of
/// once per frame.
#[derive(Debug)]
pub struct Decoder {
    rules: &'static [DecodeRule],
    short_warned: alloc::vec::Vec<bool>,
    overflow_warned: bool,
}

impl Decoder {
    pub fn new(rules: &'static [DecodeRule]) -> Self {
        Self {
            rules,
            short_warned: alloc::vec![false; rules.len()],
            overflow_warned: false,
        }
    }

    pub fn rules(&self) -> &'static [DecodeRule] {
        self.rules
    }

    pub fn decode(&mut self, bus: BusId, frame: FrameId, bytes: &[u8]) -> Decoded {
        let mut out = Decoded::new();
        let rules = self.rules;
        let warned = &mut self.short_warned;
        let complete = apply_rules(rules, bus, frame, bytes, &mut out, |index| {
            if !warned[index] {
                warned[index] = true;
                let rule = &rules[index];
                warn!(
                    "rule '{}' needs bytes {}..{} of frame {} on bus {}, got {}; skipping",
                    rule.name,
                    rule.start,
                    u16::from(rule.start) + u16::from(rule.len),
                    frame,
                    bus,
                    bytes.len()
                );
            }
        });
        if !complete && !self.overflow_warned {
            self.overflow_warned = true;
            warn!("frame {} on bus {} decodes to more than {} signals; truncated", frame, bus, MAX_DECODED);
        }
        out
    }

    /// Number of rules that have been skipped for short frames so far.
    pub fn short_rule_count(&self) -> usize {
        self.short_warned.iter().filter(|w| **w).count()
    }
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    if bits == 0 || bits >= 32 {
        return value as i32;
    }
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}
