//! [`Supervisor`] – process lifecycle for every module of the cell.
//!
//! The supervisor never touches the Register Bus.  It observes process
//! liveness (PID) and socket liveness (listen ports) only, so a wedged bus
//! cannot stop it from restarting modules.
//!
//! | Operation | Effect |
//! |---|---|
//! | [`start`](Supervisor::start) | optional `serial.port` rewrite, spawn, settle, verify alive |
//! | [`stop`](Supervisor::stop) | SIGTERM, grace period, force-kill |
//! | [`status`](Supervisor::status) | PID alive and listen port up |
//! | [`sweep_loop`](Supervisor::sweep_loop) | periodic [`CellStatus`] broadcast |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use m1cell_types::CellError;
use m1cell_types::config::{self, ModuleConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::ports::{PROBE_TIMEOUT, port_accepts};
use crate::process::{ExitRecord, LaunchSpec, ProcessHandle};
use crate::registry::{BUS_ID, CellRegistry};

/// Host used to probe module listen ports.
const LOCAL_HOST: &str = "127.0.0.1";

const STATUS_CHANNEL_CAPACITY: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SupervisorError {
    #[error("unknown module {0:?}")]
    UnknownModule(String),

    #[error("module {0:?} is already running")]
    AlreadyRunning(String),

    #[error("module {0:?} is still stopping")]
    Stopping(String),

    #[error("module {module:?} failed to start (exit code {code:?})")]
    StartFailed {
        module: String,
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    #[error("module {0:?} needs a serial port and none is configured")]
    SerialPortRequired(String),

    #[error(transparent)]
    Cell(#[from] CellError),
}

// ────────────────────────────────────────────────────────────────────────────
// Status snapshots
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub id: String,
    /// PID alive and, when the module has a listen port, the port accepts.
    pub running: bool,
    /// A stop is in progress; `running` is `false` meanwhile.
    #[serde(default)]
    pub stopping: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_s: Option<u64>,
    /// `None` when the module has no listen port.
    pub port_up: Option<bool>,
    pub last_exit: Option<ExitRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStatus {
    pub host: String,
    pub port: u16,
    pub port_up: bool,
    /// The supervisor owns the bus process.
    pub managed: bool,
    pub running: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellStatus {
    pub at: DateTime<Utc>,
    pub bus: BusStatus,
    pub modules: Vec<ModuleStatus>,
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

pub struct Supervisor {
    registry: CellRegistry,
    handles: Mutex<HashMap<String, ProcessHandle>>,
    updates: broadcast::Sender<CellStatus>,
}

impl Supervisor {
    pub fn new(registry: CellRegistry) -> Self {
        let mut handles = HashMap::new();
        for m in &registry.modules {
            handles.insert(m.id.clone(), ProcessHandle::idle(&m.id));
        }
        if registry.bus.program.is_some() {
            handles.insert(BUS_ID.to_string(), ProcessHandle::idle(BUS_ID));
        }
        let (updates, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            registry,
            handles: Mutex::new(handles),
            updates,
        }
    }

    pub fn registry(&self) -> &CellRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CellStatus> {
        self.updates.subscribe()
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.registry.supervisor.settle_ms)
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.registry.supervisor.stop_timeout_ms)
    }

    fn launch_spec(&self, id: &str) -> Result<LaunchSpec, SupervisorError> {
        if id == BUS_ID
            && let Some(program) = &self.registry.bus.program
        {
            return Ok(LaunchSpec {
                program: program.clone(),
                args: self.registry.bus.args.clone(),
                config_path: None,
            });
        }
        let m = self
            .registry
            .module(id)
            .ok_or_else(|| SupervisorError::UnknownModule(id.to_string()))?;
        Ok(LaunchSpec {
            program: m
                .program
                .clone()
                .unwrap_or_else(|| self.registry.supervisor.program.clone()),
            args: m.args.clone(),
            config_path: Some(m.config_path.clone()),
        })
    }

    fn web_port(&self, id: &str) -> Option<u16> {
        self.registry.module(id).and_then(|m| m.web_port)
    }

    /// Rewrite `serial.port` when a port is supplied, otherwise make sure
    /// the module's config already names one (or simulates its device).
    fn prepare_serial(&self, id: &str, serial_port: Option<&str>) -> Result<(), SupervisorError> {
        let Some(m) = self.registry.module(id) else {
            return Ok(());
        };
        if !m.needs_serial_port {
            return Ok(());
        }
        if let Some(port) = serial_port.map(str::trim).filter(|p| !p.is_empty()) {
            config::set_serial_port(&m.config_path, port)?;
            info!(module = %id, port, "serial port written to module config");
            return Ok(());
        }
        let raw = std::fs::read_to_string(&m.config_path).map_err(|e| {
            CellError::Config(format!("failed to read {}: {e}", m.config_path.display()))
        })?;
        // Parse without validating: an empty port is exactly what we check.
        let cfg: ModuleConfig = toml::from_str(&raw).map_err(|e| {
            CellError::Config(format!("failed to parse {}: {e}", m.config_path.display()))
        })?;
        if cfg.serial.port.trim().is_empty() && !cfg.device.simulate {
            return Err(SupervisorError::SerialPortRequired(id.to_string()));
        }
        Ok(())
    }

    /// Start `id`.  Success means the process is still alive after the
    /// settle window.
    pub async fn start(
        &self,
        id: &str,
        serial_port: Option<&str>,
    ) -> Result<ModuleStatus, SupervisorError> {
        let spec = self.launch_spec(id)?;
        {
            let mut handles = self.handles.lock().await;
            let handle = handles
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownModule(id.to_string()))?;
            if handle.is_stopping() {
                return Err(SupervisorError::Stopping(id.to_string()));
            }
            if handle.is_alive() {
                return Err(SupervisorError::AlreadyRunning(id.to_string()));
            }
            self.prepare_serial(id, serial_port)?;
            handle.spawn(&spec)?;
        }

        tokio::time::sleep(self.settle()).await;

        {
            let mut handles = self.handles.lock().await;
            if let Some(handle) = handles.get_mut(id)
                && !handle.is_alive()
            {
                let (code, stderr_tail) = handle
                    .last_exit()
                    .map(|e| (e.code, e.stderr_tail.clone()))
                    .unwrap_or_default();
                warn!(module = %id, code = ?code, "module exited during settle window");
                return Err(SupervisorError::StartFailed {
                    module: id.to_string(),
                    code,
                    stderr_tail,
                });
            }
        }

        if let Some(port) = self.web_port(id)
            && !self.wait_for_port(port, self.settle()).await
        {
            warn!(module = %id, port, "module alive but listen port not up yet");
        }

        let status = self.status(id).await?;
        info!(module = %id, pid = ?status.pid, "module started");
        Ok(status)
    }

    async fn wait_for_port(&self, port: u16, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if port_accepts(LOCAL_HOST, port, PROBE_TIMEOUT).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop `id`.  Stopping a module that is not running, or is already
    /// stopping, is a no-op.
    pub async fn stop(&self, id: &str) -> Result<ModuleStatus, SupervisorError> {
        // Only the child leaves the map, so status and sweeps keep seeing
        // the module while the grace period runs.
        let stopping = {
            let mut handles = self.handles.lock().await;
            let handle = handles
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownModule(id.to_string()))?;
            if handle.is_alive() {
                handle.begin_stop()
            } else {
                None
            }
        };
        match stopping {
            Some(stopping) => {
                info!(module = %id, "stopping module");
                let status = stopping.finish(self.stop_grace()).await;
                if let Some(handle) = self.handles.lock().await.get_mut(id) {
                    handle.end_stop(status);
                }
            }
            None => debug!(module = %id, "stop requested for a module that is not running"),
        }
        self.status(id).await
    }

    /// Stop everything the supervisor started.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(module = %id, error = %e, "stop failed during shutdown");
            }
        }
    }

    pub async fn status(&self, id: &str) -> Result<ModuleStatus, SupervisorError> {
        let mut status = {
            let mut handles = self.handles.lock().await;
            let handle = handles
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownModule(id.to_string()))?;
            let alive = handle.is_alive();
            ModuleStatus {
                id: id.to_string(),
                running: alive,
                stopping: handle.is_stopping(),
                pid: handle.pid(),
                started_at: handle.started_at(),
                uptime_s: handle.uptime().map(|d| d.as_secs()),
                port_up: None,
                last_exit: handle.last_exit().cloned(),
            }
        };
        if let Some(port) = self.web_port(id) {
            let up = port_accepts(LOCAL_HOST, port, PROBE_TIMEOUT).await;
            status.port_up = Some(up);
            status.running = status.running && up;
        }
        Ok(status)
    }

    pub async fn status_all(&self) -> CellStatus {
        let mut modules = Vec::with_capacity(self.registry.modules.len());
        for m in &self.registry.modules {
            match self.status(&m.id).await {
                Ok(s) => modules.push(s),
                Err(e) => warn!(module = %m.id, error = %e, "status failed"),
            }
        }
        let bus = &self.registry.bus;
        let running = if bus.program.is_some() {
            self.status(BUS_ID).await.ok().map(|s| s.running)
        } else {
            None
        };
        CellStatus {
            at: Utc::now(),
            bus: BusStatus {
                host: bus.host.clone(),
                port: bus.port,
                port_up: port_accepts(&bus.host, bus.port, PROBE_TIMEOUT).await,
                managed: bus.program.is_some(),
                running,
            },
            modules,
        }
    }

    /// Refresh every status each `sweep_interval_ms` and publish it.
    pub async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.registry.supervisor.sweep_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: HashMap<String, bool> = HashMap::new();
        let mut bus_was_up: Option<bool> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let snapshot = self.status_all().await;
            for m in &snapshot.modules {
                let prev = last.insert(m.id.clone(), m.running);
                if prev.is_some_and(|p| p != m.running) {
                    if m.running {
                        info!(module = %m.id, pid = ?m.pid, "module is running");
                    } else {
                        warn!(module = %m.id, last_exit = ?m.last_exit.as_ref().map(|e| e.code), "module is down");
                    }
                }
            }
            if bus_was_up.is_some_and(|p| p != snapshot.bus.port_up) {
                if snapshot.bus.port_up {
                    info!(port = snapshot.bus.port, "register bus port is up");
                } else {
                    warn!(port = snapshot.bus.port, "register bus port is down");
                }
            }
            bus_was_up = Some(snapshot.bus.port_up);
            // No subscribers is fine.
            let _ = self.updates.send(snapshot);
        }
        debug!("sweep loop stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    /// A registry whose modules run `sh -c <script>`.
    fn registry(dir: &std::path::Path, scripts: &[(&str, u16, &str)], extra: &str) -> CellRegistry {
        let mut body = format!(
            "[supervisor]\nsettle_ms = 200\nstop_timeout_ms = 500\n[bus]\nport = 1\n{extra}\n"
        );
        for (id, base, script) in scripts {
            body.push_str(&format!(
                "[[modules]]\nid = \"{id}\"\nstatus_base = {base}\nprogram = \"sh\"\nargs = [\"-c\", {script:?}, \"sh\"]\nconfig_path = \"{}\"\n",
                dir.join(format!("{id}.toml")).display()
            ));
        }
        let r = CellRegistry::from_toml_str(&body).unwrap_or_else(|e| panic!("{e}"));
        r.validate().unwrap_or_else(|e| panic!("{e}"));
        r
    }

    #[tokio::test]
    async fn start_stop_and_status() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let sup = Supervisor::new(registry(dir.path(), &[("a", 100, "sleep 30")], ""));

        let started = sup.start("a", None).await?;
        assert!(started.running);
        assert!(started.pid.is_some());
        assert_eq!(started.port_up, None);

        assert!(matches!(
            sup.start("a", None).await,
            Err(SupervisorError::AlreadyRunning(_))
        ));

        let stopped = sup.stop("a").await?;
        assert!(!stopped.running);
        assert!(stopped.last_exit.is_some());

        // Restart after stop.
        assert!(sup.start("a", None).await?.running);
        sup.stop_all().await;
        assert!(!sup.status("a").await?.running);
        Ok(())
    }

    #[tokio::test]
    async fn module_stays_visible_while_stopping() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut reg = registry(dir.path(), &[("slow", 100, "trap '' TERM; sleep 30 & wait")], "");
        reg.supervisor.stop_timeout_ms = 1500;
        let sup = Arc::new(Supervisor::new(reg));
        sup.start("slow", None).await?;

        let stopper = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.stop("slow").await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let cell = sup.status_all().await;
        let slow = cell.modules.iter().find(|m| m.id == "slow").ok_or("slow missing")?;
        assert!(slow.stopping);
        assert!(!slow.running);
        assert!(slow.pid.is_some());
        assert!(matches!(sup.start("slow", None).await, Err(SupervisorError::Stopping(_))));
        assert!(!sup.stop("slow").await?.running);

        let stopped = tokio::time::timeout(Duration::from_secs(5), stopper).await???;
        assert!(!stopped.stopping);
        assert!(!stopped.running);
        assert!(stopped.last_exit.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn early_exit_reports_code_and_stderr() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let sup = Supervisor::new(registry(
            dir.path(),
            &[("bad", 100, "echo 'config: no such port' >&2; exit 2")],
            "",
        ));
        match sup.start("bad", None).await {
            Err(SupervisorError::StartFailed { code, stderr_tail, .. }) => {
                assert_eq!(code, Some(2));
                assert!(stderr_tail.iter().any(|l| l.contains("no such port")));
            }
            other => panic!("expected StartFailed, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_module_is_refused() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let sup = Supervisor::new(registry(dir.path(), &[], ""));
        assert!(matches!(sup.start("ghost", None).await, Err(SupervisorError::UnknownModule(_))));
        assert!(matches!(sup.stop("ghost").await, Err(SupervisorError::UnknownModule(_))));
        Ok(())
    }

    #[tokio::test]
    async fn serial_port_is_written_before_start() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cfg_path = dir.path().join("pgc.toml");
        fs::write(
            &cfg_path,
            "module_id = \"pgc\"\n[mapping]\nstatus_base = 540\n[device]\nkind = \"pgc_gripper\"\nspeed_limit = 70\n",
        )?;
        let body = format!(
            "[supervisor]\nsettle_ms = 200\n[[modules]]\nid = \"pgc\"\nstatus_base = 540\nprogram = \"sh\"\nargs = [\"-c\", \"sleep 30\", \"sh\"]\nconfig_path = \"{}\"\nneeds_serial_port = true\n",
            cfg_path.display()
        );
        let reg = CellRegistry::from_toml_str(&body)?;
        let sup = Supervisor::new(reg);

        assert!(matches!(
            sup.start("pgc", None).await,
            Err(SupervisorError::SerialPortRequired(_))
        ));

        sup.start("pgc", Some("/dev/ttyUSB3")).await?;
        let written = fs::read_to_string(&cfg_path)?;
        let cfg = ModuleConfig::from_toml_str(&written)?;
        assert_eq!(cfg.serial.port, "/dev/ttyUSB3");
        assert_eq!(cfg.mapping.status_base, 540);
        assert!(written.contains("speed_limit"));
        sup.stop_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn listen_port_gates_running() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let body = format!(
            "[supervisor]\nsettle_ms = 200\n[[modules]]\nid = \"web\"\nstatus_base = 100\nprogram = \"sh\"\nargs = [\"-c\", \"sleep 30\", \"sh\"]\nconfig_path = \"{}\"\nweb_port = {port}\n",
            dir.path().join("web.toml").display()
        );
        let sup = Supervisor::new(CellRegistry::from_toml_str(&body)?);
        let up = sup.start("web", None).await?;
        assert_eq!(up.port_up, Some(true));
        assert!(up.running);

        drop(listener);
        let down = sup.status("web").await?;
        assert_eq!(down.port_up, Some(false));
        assert!(!down.running);
        assert!(down.pid.is_some());
        sup.stop_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn sweep_publishes_cell_status() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut reg = registry(dir.path(), &[("a", 100, "sleep 30")], "");
        reg.supervisor.sweep_interval_ms = 2000;
        let sup = Arc::new(Supervisor::new(reg));
        let mut rx = sup.subscribe();
        let (tx, shutdown) = watch::channel(false);
        let sweeper = tokio::spawn(Arc::clone(&sup).sweep_loop(shutdown));

        // The first tick fires immediately.
        let snapshot = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await??;
        assert_eq!(snapshot.modules.len(), 1);
        assert!(!snapshot.modules[0].running);
        assert!(!snapshot.bus.managed);
        assert!(!snapshot.bus.port_up);

        tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(3), sweeper).await??;
        Ok(())
    }

    #[tokio::test]
    async fn managed_bus_is_addressable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let sup = Supervisor::new(registry(
            dir.path(),
            &[],
            "program = \"sh\"\nargs = [\"-c\", \"sleep 30\"]",
        ));
        assert!(sup.start(BUS_ID, None).await?.running);
        let cell = sup.status_all().await;
        assert!(cell.bus.managed);
        assert_eq!(cell.bus.running, Some(true));
        sup.stop(BUS_ID).await?;
        Ok(())
    }
}
