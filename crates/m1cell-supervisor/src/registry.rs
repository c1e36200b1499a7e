//! [`CellRegistry`] – the supervisor's view of the cell, loaded once at start.
//!
//! ```toml
//! [supervisor]
//! port = 8090
//! sweep_interval_ms = 3000
//! program = "m1cell"
//!
//! [bus]
//! port = 502
//! register_count = 2000
//! program = "m1cell"              # optional: supervise the bus process too
//! args = ["bus", "--bind", "127.0.0.1:502"]
//!
//! [[modules]]
//! id = "led"
//! status_base = 500               # command_base defaults to status_base + 20
//! config_path = "modules/led.toml"
//! web_port = 8101
//!
//! [[modules]]
//! id = "pgc"
//! status_base = 540
//! config_path = "modules/pgc.toml"
//! needs_serial_port = true
//! ```
//!
//! Loading refuses (with [`CellError::Config`]) any registry in which two
//! windows overlap, a window leaves the address space, an id repeats, or a
//! module's own config file maps it somewhere else.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use m1cell_types::config::ModuleConfig;
use m1cell_types::layout::{COMMAND_OFFSET, DEFAULT_COMMAND_LEN, DEFAULT_REGISTER_COUNT, STATUS_LEN};
use m1cell_types::{CellError, RegisterWindow};
use serde::{Deserialize, Serialize};

/// Module id under which a supervised bus process is addressed.
pub const BUS_ID: &str = "bus";

pub const MIN_SWEEP_MS: u64 = 2000;
pub const MAX_SWEEP_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,
    /// How long a freshly spawned process must stay alive to count as started.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Grace period between SIGTERM and a forced kill.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Program launched for modules that do not name their own.
    #[serde(default = "default_program")]
    pub program: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
    #[serde(default = "default_register_count")]
    pub register_count: u16,
    /// When set, the supervisor also owns the bus process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One registered module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub id: String,
    pub status_base: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_base: Option<u16>,
    #[serde(default = "default_command_len")]
    pub command_len: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default = "default_module_args")]
    pub args: Vec<String>,
    /// Relative paths resolve against the registry file's directory.
    pub config_path: PathBuf,
    #[serde(default)]
    pub needs_serial_port: bool,
    /// Listen port of the module's web surface; corroborates liveness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_port: Option<u16>,
}

impl ModuleEntry {
    pub fn status_window(&self) -> RegisterWindow {
        RegisterWindow::new(self.status_base, STATUS_LEN)
    }

    pub fn command_window(&self) -> RegisterWindow {
        let base = self
            .command_base
            .unwrap_or_else(|| self.status_base.saturating_add(COMMAND_OFFSET));
        RegisterWindow::new(base, self.command_len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRegistry {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_sweep_ms() -> u64 {
    3000
}
fn default_settle_ms() -> u64 {
    1500
}
fn default_stop_timeout_ms() -> u64 {
    3000
}
fn default_program() -> String {
    "m1cell".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_bus_port() -> u16 {
    502
}
fn default_register_count() -> u16 {
    DEFAULT_REGISTER_COUNT
}
fn default_command_len() -> u16 {
    DEFAULT_COMMAND_LEN
}
fn default_module_args() -> Vec<String> {
    vec!["bridge".to_string()]
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            sweep_interval_ms: default_sweep_ms(),
            settle_ms: default_settle_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            program: default_program(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_bus_port(),
            register_count: default_register_count(),
            program: None,
            args: Vec::new(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loading and validation
// ────────────────────────────────────────────────────────────────────────────

impl CellRegistry {
    /// Read, resolve relative config paths against the file's directory,
    /// and validate.
    pub fn load(path: &Path) -> Result<Self, CellError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| CellError::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut registry = Self::from_toml_str(&raw)?;
        if let Some(dir) = path.parent() {
            for m in &mut registry.modules {
                if m.config_path.is_relative() {
                    m.config_path = dir.join(&m.config_path);
                }
            }
        }
        registry.validate()?;
        Ok(registry)
    }

    /// Parse without validating.
    pub fn from_toml_str(raw: &str) -> Result<Self, CellError> {
        toml::from_str(raw).map_err(|e| CellError::Config(format!("registry parse error: {e}")))
    }

    pub fn module(&self, id: &str) -> Option<&ModuleEntry> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn validate(&self) -> Result<(), CellError> {
        let sweep = self.supervisor.sweep_interval_ms;
        if !(MIN_SWEEP_MS..=MAX_SWEEP_MS).contains(&sweep) {
            return Err(CellError::Config(format!(
                "supervisor.sweep_interval_ms = {sweep} outside {MIN_SWEEP_MS}..={MAX_SWEEP_MS}"
            )));
        }

        let mut ids = HashSet::new();
        for m in &self.modules {
            if m.id.trim().is_empty() || m.id == BUS_ID {
                return Err(CellError::Config(format!("invalid module id {:?}", m.id)));
            }
            if !ids.insert(m.id.as_str()) {
                return Err(CellError::Config(format!("module id {:?} registered twice", m.id)));
            }
        }

        let mut claimed: Vec<(&str, &str, RegisterWindow)> = Vec::new();
        for m in &self.modules {
            for (kind, window) in [("status", m.status_window()), ("command", m.command_window())] {
                if !window.fits_within(self.bus.register_count) {
                    return Err(CellError::Config(format!(
                        "{}: {kind} window {window} exceeds bus address space of {}",
                        m.id, self.bus.register_count
                    )));
                }
                if let Some((other, other_kind, other_window)) =
                    claimed.iter().find(|(_, _, w)| w.overlaps(&window))
                {
                    return Err(CellError::Config(format!(
                        "{}: {kind} window {window} overlaps {other} {other_kind} window {other_window}",
                        m.id
                    )));
                }
                claimed.push((m.id.as_str(), kind, window));
            }
        }

        for m in &self.modules {
            check_config_mapping(m)?;
        }
        Ok(())
    }
}

/// A module config file that exists must map the module exactly where the
/// registry does.
fn check_config_mapping(m: &ModuleEntry) -> Result<(), CellError> {
    let Ok(raw) = fs::read_to_string(&m.config_path) else {
        return Ok(());
    };
    let cfg: ModuleConfig = toml::from_str(&raw).map_err(|e| {
        CellError::Config(format!("{}: failed to parse {}: {e}", m.id, m.config_path.display()))
    })?;
    let (file_status, file_command) = (cfg.status_window(), cfg.command_window());
    if file_status != m.status_window() || file_command != m.command_window() {
        return Err(CellError::Config(format!(
            "{}: {} maps status {file_status} / command {file_command}, registry says {} / {}",
            m.id,
            m.config_path.display(),
            m.status_window(),
            m.command_window()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(body: &str) -> Result<CellRegistry, CellError> {
        let r = CellRegistry::from_toml_str(body)?;
        r.validate()?;
        Ok(r)
    }

    #[test]
    fn colliding_bases_are_refused() {
        let err = registry(
            r#"
            [[modules]]
            id = "led"
            status_base = 500
            config_path = "/nonexistent/led.toml"

            [[modules]]
            id = "pgc"
            status_base = 500
            config_path = "/nonexistent/pgc.toml"
            "#,
        );
        assert!(matches!(err, Err(CellError::Config(msg)) if msg.contains("overlaps")));
    }

    #[test]
    fn adjacent_modules_are_accepted() -> Result<(), CellError> {
        let r = registry(
            r#"
            [[modules]]
            id = "led"
            status_base = 500
            config_path = "/nonexistent/led.toml"

            [[modules]]
            id = "pgc"
            status_base = 540
            config_path = "/nonexistent/pgc.toml"
            needs_serial_port = true
            "#,
        )?;
        let pgc = r.module("pgc").ok_or(CellError::Config("missing".into()))?;
        assert_eq!(pgc.command_window(), RegisterWindow::new(560, 5));
        assert_eq!(pgc.args, vec!["bridge".to_string()]);
        assert!(pgc.needs_serial_port);
        Ok(())
    }

    #[test]
    fn command_window_reaching_into_a_neighbour_is_refused() {
        let err = registry(
            r#"
            [[modules]]
            id = "a"
            status_base = 500
            command_len = 10
            config_path = "/nonexistent/a.toml"

            [[modules]]
            id = "b"
            status_base = 525
            config_path = "/nonexistent/b.toml"
            "#,
        );
        assert!(matches!(err, Err(CellError::Config(_))));
    }

    #[test]
    fn own_windows_must_not_overlap() {
        let err = registry(
            r#"
            [[modules]]
            id = "a"
            status_base = 500
            command_base = 510
            config_path = "/nonexistent/a.toml"
            "#,
        );
        assert!(matches!(err, Err(CellError::Config(_))));
    }

    #[test]
    fn duplicate_ids_and_reserved_names_are_refused() {
        let dup = registry(
            r#"
            [[modules]]
            id = "a"
            status_base = 100
            config_path = "a.toml"
            [[modules]]
            id = "a"
            status_base = 200
            config_path = "a.toml"
            "#,
        );
        assert!(matches!(dup, Err(CellError::Config(msg)) if msg.contains("twice")));

        let reserved = registry(
            r#"
            [[modules]]
            id = "bus"
            status_base = 100
            config_path = "bus.toml"
            "#,
        );
        assert!(reserved.is_err());
    }

    #[test]
    fn window_outside_address_space_is_refused() {
        let err = registry(
            r#"
            [bus]
            register_count = 1000
            [[modules]]
            id = "a"
            status_base = 990
            config_path = "a.toml"
            "#,
        );
        assert!(matches!(err, Err(CellError::Config(msg)) if msg.contains("address space")));
    }

    #[test]
    fn sweep_interval_is_bounded() {
        assert!(registry("[supervisor]\nsweep_interval_ms = 100\n").is_err());
        assert!(registry("[supervisor]\nsweep_interval_ms = 2000\n").is_ok());
    }

    #[test]
    fn config_file_must_agree_with_registry() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("xc100.toml"),
            "module_id = \"xc100\"\n[mapping]\nstatus_base = 0\n[device]\nkind = \"linear_stage\"\n",
        )?;
        let body = r#"
            [[modules]]
            id = "xc100"
            status_base = 1000
            config_path = "xc100.toml"
        "#;
        let registry_path = dir.path().join("cell.toml");
        fs::write(&registry_path, body)?;
        let err = CellRegistry::load(&registry_path);
        assert!(matches!(err, Err(CellError::Config(msg)) if msg.contains("registry says")));

        fs::write(&registry_path, body.replace("1000", "0"))?;
        let ok = CellRegistry::load(&registry_path)?;
        assert_eq!(ok.modules[0].config_path, dir.path().join("xc100.toml"));
        Ok(())
    }
}
