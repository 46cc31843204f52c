//! Hub-resident configuration.
//!
//! The set of settings is closed ([`SettingKey::ALL`]); every value is typed
//! and bounded. The store persists to a human-readable JSON object through a
//! [`SettingsBackend`] and loads fail-soft: anything missing or invalid in
//! the file silently becomes its default.

use arrayvec::ArrayString;
use core::fmt::Write;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

pub const BRIGHTNESS_MAX: u8 = 100;
pub const SHIFT_RPM_MIN: u16 = 2000;
pub const REDLINE_RPM_MIN: u16 = 3000;
pub const REDLINE_RPM_MAX: u16 = 12000;
pub const COOLANT_WARNING_MIN: i16 = 80;
pub const COOLANT_WARNING_MAX: i16 = 130;
pub const OIL_WARNING_MIN: u16 = 50;
pub const OIL_WARNING_MAX: u16 = 400;
/// Number of light-strip patterns the LED unit knows.
pub const PATTERN_COUNT: u8 = 3;

pub const DEFAULT_BRIGHTNESS: u8 = 60;
pub const DEFAULT_SHIFT_RPM: u16 = 6500;
pub const DEFAULT_REDLINE_RPM: u16 = 7200;
pub const DEFAULT_COOLANT_WARNING: i16 = 105;
pub const DEFAULT_OIL_WARNING: u16 = 100;
pub const DEFAULT_PATTERN: u8 = 0;

static_assertions::const_assert!(SHIFT_RPM_MIN <= DEFAULT_SHIFT_RPM);
static_assertions::const_assert!(DEFAULT_SHIFT_RPM <= DEFAULT_REDLINE_RPM);
static_assertions::const_assert!(REDLINE_RPM_MIN <= DEFAULT_REDLINE_RPM);
static_assertions::const_assert!(DEFAULT_REDLINE_RPM <= REDLINE_RPM_MAX);
static_assertions::const_assert!(DEFAULT_PATTERN < PATTERN_COUNT);

pub type ValueText = ArrayString<16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Brightness,
    ShiftRpm,
    RedlineRpm,
    Units,
    CoolantWarning,
    OilPressureWarning,
    Pattern,
}

impl SettingKey {
    /// Every key, in the order a full resync sends them.
    pub const ALL: [SettingKey; 7] = [
        SettingKey::Brightness,
        SettingKey::RedlineRpm,
        SettingKey::ShiftRpm,
        SettingKey::Units,
        SettingKey::CoolantWarning,
        SettingKey::OilPressureWarning,
        SettingKey::Pattern,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            SettingKey::Brightness => "brightness",
            SettingKey::ShiftRpm => "shift_rpm",
            SettingKey::RedlineRpm => "redline_rpm",
            SettingKey::Units => "units",
            SettingKey::CoolantWarning => "coolant_warning",
            SettingKey::OilPressureWarning => "oil_warning",
            SettingKey::Pattern => "pattern",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == text)
    }
}

impl core::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    Metric,
    Imperial,
}

impl Units {
    pub const fn as_str(self) -> &'static str {
        match self {
            Units::Metric => "metric",
            Units::Imperial => "imperial",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "metric" => Some(Units::Metric),
            "imperial" => Some(Units::Imperial),
            _ => None,
        }
    }
}

/// One key together with a typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    Brightness(u8),
    ShiftRpm(u16),
    RedlineRpm(u16),
    Units(Units),
    CoolantWarning(i16),
    OilPressureWarning(u16),
    Pattern(u8),
}

impl Setting {
    pub const fn key(&self) -> SettingKey {
        match self {
            Setting::Brightness(_) => SettingKey::Brightness,
            Setting::ShiftRpm(_) => SettingKey::ShiftRpm,
            Setting::RedlineRpm(_) => SettingKey::RedlineRpm,
            Setting::Units(_) => SettingKey::Units,
            Setting::CoolantWarning(_) => SettingKey::CoolantWarning,
            Setting::OilPressureWarning(_) => SettingKey::OilPressureWarning,
            Setting::Pattern(_) => SettingKey::Pattern,
        }
    }

    /// Parse the textual value for `key`. Syntax only; bounds are checked by
    /// [`Setting::check_bounds`].
    pub fn parse(key: SettingKey, text: &str) -> Option<Self> {
        let text = text.trim();
        Some(match key {
            SettingKey::Brightness => Setting::Brightness(text.parse().ok()?),
            SettingKey::ShiftRpm => Setting::ShiftRpm(text.parse().ok()?),
            SettingKey::RedlineRpm => Setting::RedlineRpm(text.parse().ok()?),
            SettingKey::Units => Setting::Units(Units::parse(text)?),
            SettingKey::CoolantWarning => Setting::CoolantWarning(text.parse().ok()?),
            SettingKey::OilPressureWarning => Setting::OilPressureWarning(text.parse().ok()?),
            SettingKey::Pattern => Setting::Pattern(text.parse().ok()?),
        })
    }

    pub fn value_text(&self) -> ValueText {
        let mut out = ValueText::new();
        // the longest value ("imperial", "-32768") fits in 16 bytes
        let _ = match self {
            Setting::Brightness(v) | Setting::Pattern(v) => write!(out, "{}", v),
            Setting::ShiftRpm(v) | Setting::RedlineRpm(v) | Setting::OilPressureWarning(v) => {
                write!(out, "{}", v)
            }
            Setting::CoolantWarning(v) => write!(out, "{}", v),
            Setting::Units(u) => out.try_push_str(u.as_str()).map_err(|_| core::fmt::Error),
        };
        out
    }

    fn to_json(self) -> Value {
        match self {
            Setting::Brightness(v) | Setting::Pattern(v) => Value::from(v),
            Setting::ShiftRpm(v) | Setting::RedlineRpm(v) | Setting::OilPressureWarning(v) => {
                Value::from(v)
            }
            Setting::CoolantWarning(v) => Value::from(v),
            Setting::Units(u) => Value::from(u.as_str()),
        }
    }

    fn from_json(key: SettingKey, value: &Value) -> Option<Self> {
        match (key, value) {
            (SettingKey::Units, Value::String(s)) => Units::parse(s).map(Setting::Units),
            (SettingKey::Units, _) => None,
            (_, Value::Number(n)) => Setting::parse(key, &n.to_string()),
            _ => None,
        }
    }

    /// Per-key absolute bounds. Cross-key rules live in [`Settings::validate`].
    pub fn check_bounds(&self) -> Result<(), SettingsError> {
        let (value, min, max) = match *self {
            Setting::Brightness(v) => (i32::from(v), 0, i32::from(BRIGHTNESS_MAX)),
            Setting::ShiftRpm(v) => (i32::from(v), i32::from(SHIFT_RPM_MIN), i32::from(REDLINE_RPM_MAX)),
            Setting::RedlineRpm(v) => (i32::from(v), i32::from(REDLINE_RPM_MIN), i32::from(REDLINE_RPM_MAX)),
            Setting::Units(_) => return Ok(()),
            Setting::CoolantWarning(v) => {
                (i32::from(v), i32::from(COOLANT_WARNING_MIN), i32::from(COOLANT_WARNING_MAX))
            }
            Setting::OilPressureWarning(v) => {
                (i32::from(v), i32::from(OIL_WARNING_MIN), i32::from(OIL_WARNING_MAX))
            }
            Setting::Pattern(v) => (i32::from(v), 0, i32::from(PATTERN_COUNT) - 1),
        };
        if value < min || value > max {
            return Err(SettingsError::OutOfRange { key: self.key(), value, min, max });
        }
        Ok(())
    }
}

impl core::fmt::Display for Setting {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}={}", self.key(), self.value_text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("{key} value {value} outside {min}..={max}")]
    OutOfRange { key: SettingKey, value: i32, min: i32, max: i32 },
    #[error("shift rpm {shift} above redline {redline}")]
    ShiftAboveRedline { shift: u16, redline: u16 },
    #[error("settings storage failed: {0}")]
    Storage(String),
}

/// Full set of values. Serializes to the on-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub brightness: u8,
    pub shift_rpm: u16,
    pub redline_rpm: u16,
    pub units: Units,
    pub coolant_warning: i16,
    pub oil_warning: u16,
    pub pattern: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            brightness: DEFAULT_BRIGHTNESS,
            shift_rpm: DEFAULT_SHIFT_RPM,
            redline_rpm: DEFAULT_REDLINE_RPM,
            units: Units::Metric,
            coolant_warning: DEFAULT_COOLANT_WARNING,
            oil_warning: DEFAULT_OIL_WARNING,
            pattern: DEFAULT_PATTERN,
        }
    }
}

impl Settings {
    pub fn get(&self, key: SettingKey) -> Setting {
        match key {
            SettingKey::Brightness => Setting::Brightness(self.brightness),
            SettingKey::ShiftRpm => Setting::ShiftRpm(self.shift_rpm),
            SettingKey::RedlineRpm => Setting::RedlineRpm(self.redline_rpm),
            SettingKey::Units => Setting::Units(self.units),
            SettingKey::CoolantWarning => Setting::CoolantWarning(self.coolant_warning),
            SettingKey::OilPressureWarning => Setting::OilPressureWarning(self.oil_warning),
            SettingKey::Pattern => Setting::Pattern(self.pattern),
        }
    }

    /// Bounds plus the shift/redline envelope, checked against the current
    /// values of the other keys.
    pub fn validate(&self, setting: Setting) -> Result<(), SettingsError> {
        setting.check_bounds()?;
        match setting {
            Setting::ShiftRpm(shift) if shift > self.redline_rpm => {
                Err(SettingsError::ShiftAboveRedline { shift, redline: self.redline_rpm })
            }
            Setting::RedlineRpm(redline) if redline < self.shift_rpm => {
                Err(SettingsError::ShiftAboveRedline { shift: self.shift_rpm, redline })
            }
            _ => Ok(()),
        }
    }

    /// Store `setting` without any checks.
    pub fn assign(&mut self, setting: Setting) {
        match setting {
            Setting::Brightness(v) => self.brightness = v,
            Setting::ShiftRpm(v) => self.shift_rpm = v,
            Setting::RedlineRpm(v) => self.redline_rpm = v,
            Setting::Units(v) => self.units = v,
            Setting::CoolantWarning(v) => self.coolant_warning = v,
            Setting::OilPressureWarning(v) => self.oil_warning = v,
            Setting::Pattern(v) => self.pattern = v,
        }
    }

    /// Every setting in resync order.
    pub fn iter(&self) -> impl Iterator<Item = Setting> + '_ {
        SettingKey::ALL.iter().map(move |k| self.get(*k))
    }

    pub fn to_json_pretty(&self) -> Result<String, SettingsError> {
        let mut map = Map::new();
        for setting in self.iter() {
            map.insert(setting.key().as_str().to_string(), setting.to_json());
        }
        serde_json::to_string_pretty(&Value::Object(map))
            .map_err(|e| SettingsError::Storage(e.to_string()))
    }
}

/// Where persisted settings live.
pub trait SettingsBackend {
    /// Stored contents, `None` if nothing has been saved yet.
    fn load(&mut self) -> Result<Option<String>, SettingsError>;
    fn save(&mut self, contents: &str) -> Result<(), SettingsError>;
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsBackend for FileBackend {
    fn load(&mut self) -> Result<Option<String>, SettingsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SettingsError::Storage(e.to_string())),
        }
    }

    fn save(&mut self, contents: &str) -> Result<(), SettingsError> {
        // write-then-rename so a power cut never leaves half a file behind
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(|e| SettingsError::Storage(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| SettingsError::Storage(e.to_string()))
    }
}

/// In-memory backend for tests and for nodes without storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    contents: Option<String>,
    fail_saves: bool,
    saves: u32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self { contents: Some(contents.into()), ..Self::default() }
    }

    /// Make every subsequent save fail.
    pub fn failing() -> Self {
        Self { fail_saves: true, ..Self::default() }
    }

    pub fn contents(&self) -> Option<&str> {
        self.contents.as_deref()
    }

    pub fn saves(&self) -> u32 {
        self.saves
    }
}

impl SettingsBackend for MemoryBackend {
    fn load(&mut self) -> Result<Option<String>, SettingsError> {
        Ok(self.contents.clone())
    }

    fn save(&mut self, contents: &str) -> Result<(), SettingsError> {
        if self.fail_saves {
            return Err(SettingsError::Storage("memory backend set to fail".to_string()));
        }
        self.contents = Some(contents.to_string());
        self.saves += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: u8,
    pub defaulted: u8,
    pub ignored: u8,
}

#[derive(Debug)]
pub struct SettingsStore<B: SettingsBackend> {
    backend: B,
    settings: Settings,
    save_failures: u32,
}

impl<B: SettingsBackend> SettingsStore<B> {
    /// Store holding defaults; call [`SettingsStore::load_all`] once at startup.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            settings: Settings::default(),
            save_failures: 0,
        }
    }

    /// Load every key from the backend. Never fails: unreadable storage,
    /// bad JSON, missing keys and out-of-range values all fall back to
    /// defaults, and unknown keys are ignored.
    pub fn load_all(&mut self) -> LoadReport {
        let mut report = LoadReport::default();
        let mut settings = Settings::default();

        let map = match self.backend.load() {
            Ok(Some(contents)) => match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    debug!("settings file is not a JSON object, using defaults");
                    Map::new()
                }
            },
            Ok(None) => Map::new(),
            Err(e) => {
                debug!("settings unreadable ({}), using defaults", e);
                Map::new()
            }
        };

        for key in SettingKey::ALL {
            let parsed = map
                .get(key.as_str())
                .and_then(|v| Setting::from_json(key, v))
                .filter(|s| s.check_bounds().is_ok());
            match parsed {
                Some(setting) => {
                    settings.assign(setting);
                    report.loaded += 1;
                }
                None => {
                    debug!("setting '{}' missing or invalid, using default", key);
                    report.defaulted += 1;
                }
            }
        }
        report.ignored = map
            .keys()
            .filter(|k| SettingKey::parse(k).is_none())
            .count()
            .min(usize::from(u8::MAX)) as u8;

        if settings.shift_rpm > settings.redline_rpm {
            let shift = DEFAULT_SHIFT_RPM.min(settings.redline_rpm);
            debug!(
                "stored shift rpm {} above redline {}, using {}",
                settings.shift_rpm, settings.redline_rpm, shift
            );
            settings.shift_rpm = shift;
        }

        self.settings = settings;
        info!(
            "settings loaded: {} stored, {} defaulted, {} unknown keys ignored",
            report.loaded, report.defaulted, report.ignored
        );
        report
    }

    pub fn get(&self, key: SettingKey) -> Setting {
        self.settings.get(key)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn brightness(&self) -> u8 {
        self.settings.brightness
    }

    pub fn shift_rpm(&self) -> u16 {
        self.settings.shift_rpm
    }

    pub fn redline_rpm(&self) -> u16 {
        self.settings.redline_rpm
    }

    pub fn units(&self) -> Units {
        self.settings.units
    }

    pub fn pattern(&self) -> u8 {
        self.settings.pattern
    }

    /// Validate, update and persist. Returns `Ok(false)` when the value was
    /// already current. A failed save is logged and counted but the new value
    /// still takes effect.
    pub fn set(&mut self, setting: Setting) -> Result<bool, SettingsError> {
        self.settings.validate(setting)?;
        if self.settings.get(setting.key()) == setting {
            return Ok(false);
        }
        self.settings.assign(setting);
        self.persist();
        Ok(true)
    }

    fn persist(&mut self) {
        let result = self
            .settings
            .to_json_pretty()
            .and_then(|json| self.backend.save(&json));
        if let Err(e) = result {
            self.save_failures = self.save_failures.saturating_add(1);
            error!("failed to persist settings: {}", e);
        }
    }

    pub fn save_failures(&self) -> u32 {
        self.save_failures
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
