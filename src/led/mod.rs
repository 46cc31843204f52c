//! RPM light engine for the LED unit.
//!
//! Classification ([`zone`]) is a pure function of rpm and speed. Only the
//! renderer carries animation state.

pub mod color;
pub mod engine;
pub mod render;
pub mod zone;

pub use color::ColorRamp;
pub use engine::{EngineConfig, LedUnit, RpmLightEngine};
pub use render::{LedFrame, Pattern, Renderer};
pub use zone::{classify, Zone, ZoneBands};
