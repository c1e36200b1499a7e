//! Module configuration – one TOML document per Device Bridge.
//!
//! ```toml
//! module_id = "led"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! parity = "none"
//!
//! [bus]
//! host = "127.0.0.1"
//! port = 502
//!
//! [mapping]
//! status_base = 500          # command_base defaults to status_base + 20
//!
//! [timing]
//! fast_loop_interval_ms = 50
//! device_poll_divider = 5
//!
//! [device]
//! kind = "led_controller"
//! slave_id = 1
//! max_brightness = 1000      # family-specific keys live beside `kind`
//!
//! [web]
//! enabled = true
//! port = 8101
//! ```

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::layout::{
    COMMAND_OFFSET, DEFAULT_COMMAND_LEN, DEFAULT_REGISTER_COUNT, MAX_COMMAND_LEN,
    MIN_COMMAND_LEN, RegisterWindow, STATUS_LEN,
};
use crate::{CellError, DeviceKind};

/// Fast-loop bounds in milliseconds.
pub const MIN_LOOP_INTERVAL_MS: u64 = 20;
pub const MAX_LOOP_INTERVAL_MS: u64 = 100;
/// Upper bound on `timing.command_delay_ms`.
pub const MAX_COMMAND_DELAY_MS: u64 = 60_000;
/// Target device poll period used when no divider is configured.
const TARGET_POLL_PERIOD_MS: u64 = 250;

// ────────────────────────────────────────────────────────────────────────────
// Sections
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// `[serial]` – the device side of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: SerialParity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
}

/// `[bus]` – where the Register Bus listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_host")]
    pub host: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "default_bus_timeout_ms")]
    pub timeout_ms: u64,
    /// Size of the bus address space, used to bounds-check the mapping.
    #[serde(default = "default_register_count")]
    pub register_count: u16,
}

/// `[mapping]` – where this module's windows live on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub status_base: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_base: Option<u16>,
    #[serde(default = "default_command_len")]
    pub command_len: u16,
}

/// `[timing]` – fast-loop pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_loop_interval_ms")]
    pub fast_loop_interval_ms: u64,
    /// Pause after an executed command before further device I/O.
    #[serde(default)]
    pub command_delay_ms: u64,
    /// Minimum gap between two consecutive serial transactions.
    #[serde(default = "default_serial_delay_ms")]
    pub serial_delay_ms: u64,
    /// Poll the device every k-th tick.  Derived from the loop interval
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_poll_divider: Option<u32>,
}

/// `[device]` – which family to drive, plus family-specific keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// Drive the in-process register model instead of a serial port.
    #[serde(default)]
    pub simulate: bool,
    #[serde(flatten)]
    pub options: toml::Table,
}

/// `[web]` – the optional Web Control Surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_web_bind")]
    pub bind: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Background refresh period; `0` selects manual-only mode.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

/// The full per-module document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_module_id")]
    pub module_id: String,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub bus: BusConfig,
    pub mapping: MappingConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub web: WebConfig,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_stop_bits() -> u8 {
    1
}
fn default_data_bits() -> u8 {
    8
}
fn default_device_timeout_ms() -> u64 {
    1000
}
fn default_bus_host() -> String {
    "127.0.0.1".to_string()
}
fn default_bus_port() -> u16 {
    502
}
fn default_slave_id() -> u8 {
    1
}
fn default_bus_timeout_ms() -> u64 {
    1000
}
fn default_register_count() -> u16 {
    DEFAULT_REGISTER_COUNT
}
fn default_command_len() -> u16 {
    DEFAULT_COMMAND_LEN
}
fn default_loop_interval_ms() -> u64 {
    50
}
fn default_serial_delay_ms() -> u64 {
    5
}
fn default_web_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_web_port() -> u16 {
    8100
}
fn default_refresh_interval_ms() -> u64 {
    2000
}
fn default_module_id() -> String {
    "module".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            parity: SerialParity::default(),
            stop_bits: default_stop_bits(),
            data_bits: default_data_bits(),
            timeout_ms: default_device_timeout_ms(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            slave_id: default_slave_id(),
            timeout_ms: default_bus_timeout_ms(),
            register_count: default_register_count(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            fast_loop_interval_ms: default_loop_interval_ms(),
            command_delay_ms: 0,
            serial_delay_ms: default_serial_delay_ms(),
            device_poll_divider: None,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_web_bind(),
            port: default_web_port(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl MappingConfig {
    pub fn command_base(&self) -> u16 {
        self.command_base
            .unwrap_or_else(|| self.status_base.saturating_add(COMMAND_OFFSET))
    }
}

impl TimingConfig {
    /// The effective device poll divider, never below 1.
    pub fn poll_divider(&self) -> u32 {
        match self.device_poll_divider {
            Some(k) => k.max(1),
            None => {
                let interval = self.fast_loop_interval_ms.max(1);
                (TARGET_POLL_PERIOD_MS / interval).max(1) as u32
            }
        }
    }
}

impl DeviceConfig {
    /// Deserialise the family-specific keys into `T`.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T, CellError> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e| CellError::Config(format!("[device] options for {}: {e}", self.kind)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ModuleConfig
// ────────────────────────────────────────────────────────────────────────────

impl ModuleConfig {
    /// A minimal configuration with all defaults, used by tests and tools.
    pub fn new(module_id: impl Into<String>, kind: DeviceKind, status_base: u16) -> Self {
        Self {
            module_id: module_id.into(),
            serial: SerialConfig::default(),
            bus: BusConfig::default(),
            mapping: MappingConfig {
                status_base,
                command_base: None,
                command_len: DEFAULT_COMMAND_LEN,
            },
            timing: TimingConfig::default(),
            device: DeviceConfig {
                kind,
                slave_id: default_slave_id(),
                simulate: false,
                options: toml::Table::new(),
            },
            web: WebConfig::default(),
        }
    }

    pub fn status_window(&self) -> RegisterWindow {
        RegisterWindow::new(self.mapping.status_base, STATUS_LEN)
    }

    pub fn command_window(&self) -> RegisterWindow {
        RegisterWindow::new(self.mapping.command_base(), self.mapping.command_len)
    }

    /// Parse a document from a string and validate it.
    pub fn from_toml_str(raw: &str) -> Result<Self, CellError> {
        let cfg: ModuleConfig =
            toml::from_str(raw).map_err(|e| CellError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every invariant a bridge relies on.
    pub fn validate(&self) -> Result<(), CellError> {
        let interval = self.timing.fast_loop_interval_ms;
        if !(MIN_LOOP_INTERVAL_MS..=MAX_LOOP_INTERVAL_MS).contains(&interval) {
            return Err(CellError::Config(format!(
                "timing.fast_loop_interval_ms = {interval} outside {MIN_LOOP_INTERVAL_MS}..={MAX_LOOP_INTERVAL_MS}"
            )));
        }
        let delay = self.timing.command_delay_ms;
        if delay > MAX_COMMAND_DELAY_MS {
            return Err(CellError::Config(format!(
                "timing.command_delay_ms = {delay} exceeds {MAX_COMMAND_DELAY_MS}"
            )));
        }
        if self.timing.device_poll_divider == Some(0) {
            return Err(CellError::Config(
                "timing.device_poll_divider must be at least 1".into(),
            ));
        }
        let len = self.mapping.command_len;
        if !(MIN_COMMAND_LEN..=MAX_COMMAND_LEN).contains(&len) {
            return Err(CellError::Config(format!(
                "mapping.command_len = {len} outside {MIN_COMMAND_LEN}..={MAX_COMMAND_LEN}"
            )));
        }
        let status = self.status_window();
        let command = self.command_window();
        if status.overlaps(&command) {
            return Err(CellError::Config(format!(
                "status window {status} overlaps command window {command}"
            )));
        }
        for (name, window) in [("status", status), ("command", command)] {
            if !window.fits_within(self.bus.register_count) {
                return Err(CellError::Config(format!(
                    "{name} window {window} exceeds bus address space of {}",
                    self.bus.register_count
                )));
            }
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(CellError::Config(format!(
                "serial.data_bits = {} outside 5..=8",
                self.serial.data_bits
            )));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(CellError::Config(format!(
                "serial.stop_bits = {} outside 1..=2",
                self.serial.stop_bits
            )));
        }
        if !self.device.simulate && self.serial.port.trim().is_empty() {
            return Err(CellError::Config(
                "serial.port is empty and device.simulate is false".into(),
            ));
        }
        let refresh = self.web.refresh_interval_ms;
        if refresh != 0 && !(1000..=3000).contains(&refresh) {
            return Err(CellError::Config(format!(
                "web.refresh_interval_ms = {refresh} must be 0 or within 1000..=3000"
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Disk I/O
// ────────────────────────────────────────────────────────────────────────────

/// Load, override from the environment, and validate a module config.
pub fn load_from(path: &Path) -> Result<ModuleConfig, CellError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CellError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: ModuleConfig = toml::from_str(&raw)
        .map_err(|e| CellError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Write `cfg` to `path` as pretty TOML.
pub fn save_to(cfg: &ModuleConfig, path: &Path) -> Result<(), CellError> {
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| CellError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| CellError::Config(format!("failed to write {}: {e}", path.display())))
}

/// Apply `M1CELL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `M1CELL_BUS_HOST` | `bus.host` |
/// | `M1CELL_BUS_PORT` | `bus.port` |
/// | `M1CELL_SERIAL_PORT` | `serial.port` |
/// | `M1CELL_WEB_PORT` | `web.port` |
pub fn apply_env_overrides(cfg: &mut ModuleConfig) {
    if let Ok(v) = std::env::var("M1CELL_BUS_HOST") {
        cfg.bus.host = v;
    }
    if let Ok(v) = std::env::var("M1CELL_BUS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bus.port = port;
    }
    if let Ok(v) = std::env::var("M1CELL_SERIAL_PORT") {
        cfg.serial.port = v;
    }
    if let Ok(v) = std::env::var("M1CELL_WEB_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.web.port = port;
    }
}

/// Rewrite only `serial.port` in the document at `path`.
///
/// The document is edited as a generic TOML table so that unknown and
/// family-specific keys survive untouched.
pub fn set_serial_port(path: &Path, port: &str) -> Result<(), CellError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CellError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut doc: toml::Table = raw
        .parse()
        .map_err(|e| CellError::Config(format!("failed to parse {}: {e}", path.display())))?;

    let serial = doc
        .entry("serial")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let Some(serial) = serial.as_table_mut() else {
        return Err(CellError::Config(format!(
            "{}: [serial] is not a table",
            path.display()
        )));
    };
    serial.insert("port".to_string(), toml::Value::String(port.to_string()));

    let out = toml::to_string_pretty(&doc)
        .map_err(|e| CellError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, out)
        .map_err(|e| CellError::Config(format!("failed to write {}: {e}", path.display())))
}
