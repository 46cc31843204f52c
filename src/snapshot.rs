use arrayvec::ArrayString;
use heapless::FnvIndexMap;
use serde::Serialize;
use thiserror::Error;

/// Capacity of a snapshot table. Must stay a power of two.
pub const MAX_SIGNALS: usize = 64;
pub const MAX_SIGNAL_NAME: usize = 24;
pub const DEFAULT_STALE_AFTER_MS: u64 = 2000;

pub type SignalName = ArrayString<MAX_SIGNAL_NAME>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Signal {
    pub name: SignalName,
    pub value: f32,
    pub unit: &'static str,
    pub updated_at: u64,
    /// Snapshot-wide revision of the last write to this key.
    pub revision: u64,
    pub valid: bool,
}

impl Signal {
    pub fn is_fresh(&self, now: u64, stale_after_ms: u64) -> bool {
        self.valid && now.saturating_sub(self.updated_at) <= stale_after_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("signal name longer than {} bytes", MAX_SIGNAL_NAME)]
    NameTooLong,
    #[error("snapshot full ({} signals)", MAX_SIGNALS)]
    Full,
}

/// Latest value of every known signal.
///
/// Each key has exactly one producer (a bus listener or a link), so writes
/// never contend and never block. Readers get `None` for anything that has
/// not been refreshed within the staleness window: stale means unknown,
/// never zero.
#[derive(Debug)]
pub struct Snapshot {
    signals: FnvIndexMap<SignalName, Signal, MAX_SIGNALS>,
    stale_after_ms: u64,
    revision: u64,
    rejected: u32,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER_MS)
    }

    pub fn with_stale_after(stale_after_ms: u64) -> Self {
        Self {
            signals: FnvIndexMap::new(),
            stale_after_ms,
            revision: 0,
            rejected: 0,
        }
    }

    /// Overwrite (or create) a signal and return its new revision.
    pub fn update(
        &mut self,
        name: &str,
        value: f32,
        unit: &'static str,
        now: u64,
    ) -> Result<u64, SnapshotError> {
        let revision = self.revision + 1;

        if let Some(signal) = self.signals.get_mut(name) {
            signal.value = value;
            signal.unit = unit;
            signal.updated_at = now;
            signal.revision = revision;
            signal.valid = true;
            self.revision = revision;
            return Ok(revision);
        }

        let key = SignalName::from(name).map_err(|_| SnapshotError::NameTooLong)?;
        let signal = Signal {
            name: key,
            value,
            unit,
            updated_at: now,
            revision,
            valid: true,
        };
        if self.signals.insert(key, signal).is_err() {
            self.rejected = self.rejected.saturating_add(1);
            return Err(SnapshotError::Full);
        }
        self.revision = revision;
        Ok(revision)
    }

    /// Raw entry, including stale ones.
    pub fn get(&self, name: &str) -> Option<&Signal> {
        self.signals.get(name)
    }

    /// Current value, or `None` when missing or stale.
    pub fn value(&self, name: &str, now: u64) -> Option<f32> {
        self.signals
            .get(name)
            .filter(|s| s.is_fresh(now, self.stale_after_ms))
            .map(|s| s.value)
    }

    pub fn is_fresh(&self, name: &str, now: u64) -> bool {
        self.value(name, now).is_some()
    }

    /// Clear the validity flag of every entry past the staleness window.
    /// Returns how many entries went stale in this call.
    pub fn expire(&mut self, now: u64) -> usize {
        let stale_after = self.stale_after_ms;
        let mut expired = 0;
        for signal in self.signals.values_mut() {
            if signal.valid && !signal.is_fresh(now, stale_after) {
                signal.valid = false;
                expired += 1;
            }
        }
        expired
    }

    pub fn invalidate(&mut self, name: &str) {
        if let Some(signal) = self.signals.get_mut(name) {
            signal.valid = false;
        }
    }

    /// Fresh signals written after `revision`, in insertion order.
    pub fn changed_since(&self, revision: u64, now: u64) -> impl Iterator<Item = &Signal> + '_ {
        let stale_after = self.stale_after_ms;
        self.signals
            .values()
            .filter(move |s| s.revision > revision && s.is_fresh(now, stale_after))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signal> + '_ {
        self.signals.values()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn stale_after_ms(&self) -> u64 {
        self.stale_after_ms
    }

    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn clear(&mut self) {
        self.signals.clear();
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}
