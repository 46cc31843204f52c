//! # dashbus
//!
//! Vehicle telemetry distribution for a small dashboard network: one hub on
//! the vehicle's CAN buses, an LED shift-light unit with its own bus tap, and
//! a display unit that also scans wireless tire sensors.
//!
//! ## Features
//!
//! - **Passive bus ingestion**: receive-only [`listener::PassiveBus`] seam,
//!   interrupt-to-main-loop queue, error-window resets with backoff
//! - **Data-driven decoding**: one rule table ([`rules::VEHICLE_RULES`]) maps
//!   frame bytes to named signals
//! - **Latest-value snapshot** with staleness and per-key revisions
//! - **Line protocol** to the peripherals with acked settings, coalesced
//!   telemetry and full replay after a reconnect
//! - **Shift light**: stateless zone classification, fractional bar
//!   rendering, pulse and sweep animations
//! - **Bounded memory**: fixed-capacity queues and tables throughout
//!
//! ## Quick Start
//!
//! ```rust
//! use dashbus::{Frame, Decoder, Snapshot, rules};
//!
//! let mut decoder = Decoder::new(&rules::VEHICLE_RULES);
//! let mut snapshot = Snapshot::new();
//!
//! let frame = Frame::standard(0, 0x201, &[0x1F, 0x40, 0, 0, 0x27, 0x10, 0, 0]).unwrap();
//! for signal in decoder.decode(frame.bus(), frame.frame_id(), frame.payload()) {
//!     snapshot.update(signal.name, signal.value, signal.unit, 0).unwrap();
//! }
//! assert_eq!(snapshot.value("rpm", 0), Some(2000.0));
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] / [`decoder`] / [`rules`] - frames, decode rules, vehicle schema
//! - [`listener`] - per-bus ingestion into the [`snapshot`]
//! - [`protocol`] / [`link`] - wire format and per-peripheral link state
//! - [`settings`] - typed, persisted configuration
//! - [`hub`] - the orchestrating main loop
//! - [`peripheral`] - peripheral-side mirror of the link
//! - [`led`] - RPM light engine
//! - [`sensor`] - tire sensor forwarder
//! - [`display`] - display unit hosting the forwarder

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

pub mod decoder;
pub mod display;
pub mod frame;
pub mod hub;
pub mod led;
pub mod link;
pub mod listener;
pub mod peripheral;
pub mod protocol;
pub mod rules;
pub mod sensor;
pub mod settings;
pub mod snapshot;

pub use decoder::{DecodeRule, DecodedSignal, Decoder};
pub use display::DisplayUnit;
pub use frame::{BusId, Frame, FrameId, LoggedFrame};
pub use hub::{Hub, HubConfig, HubError, PeripheralId};
pub use led::{LedUnit, RpmLightEngine, Zone, ZoneBands};
pub use link::{LineWriter, LinkConfig, LinkState, SerialLink};
pub use listener::{BusListener, ListenerConfig, PassiveBus};
pub use peripheral::PeripheralMirror;
pub use protocol::{Command, Message, ParseError};
pub use sensor::{SensorForwarder, SensorScanner, TpmsReading};
pub use settings::{Setting, SettingKey, Settings, SettingsError, SettingsStore};
pub use snapshot::{Signal, Snapshot};
