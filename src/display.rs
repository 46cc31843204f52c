//! The display peripheral: its end of the hub link plus the tire sensor
//! forwarder it hosts.

use crate::peripheral::PeripheralMirror;
use crate::protocol::Message;
use crate::sensor::{ForwarderConfig, SensorForwarder, SensorScanner, SensorView};
use crate::settings::Setting;
use alloc::vec::Vec;

pub struct DisplayUnit<S: SensorScanner> {
    mirror: PeripheralMirror,
    forwarder: SensorForwarder<S>,
}

impl<S: SensorScanner> DisplayUnit<S> {
    pub fn new(scanner: S, config: ForwarderConfig) -> Self {
        Self {
            mirror: PeripheralMirror::new(),
            forwarder: SensorForwarder::new(scanner, config),
        }
    }

    /// Line announcing this unit to the hub after power-up.
    pub fn boot(&mut self) -> Message {
        self.mirror.reboot()
    }

    /// Handle a line from the hub; returns the reply, if any.
    pub fn handle_line(&mut self, line: &str, now: u64) -> Option<Message> {
        self.mirror.handle_line(line, now)
    }

    /// Run the sensor scan cycle. Returns the lines to send to the hub.
    pub fn poll(&mut self, now: u64) -> Vec<Message> {
        self.forwarder.poll(now)
    }

    /// A change made on the unit's own controls, to be sent to the hub.
    pub fn request(&self, setting: Setting) -> Option<Message> {
        self.mirror.local_setting(setting)
    }

    /// Tire readings as shown on screen, stale ones flagged.
    pub fn tires(&self, now: u64) -> impl Iterator<Item = SensorView> + '_ {
        self.forwarder.views(now)
    }

    pub fn mirror(&self) -> &PeripheralMirror {
        &self.mirror
    }

    pub fn forwarder(&self) -> &SensorForwarder<S> {
        &self.forwarder
    }

    pub fn forwarder_mut(&mut self) -> &mut SensorForwarder<S> {
        &mut self.forwarder
    }
}
