//! Subcommand runners.  Each one initialises its process, waits for a
//! shutdown signal and tears down in reverse order.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use colored::Colorize;
use m1cell_bridge::Bridge;
use m1cell_bus::{BusServer, RegisterBank};
use m1cell_cockpit::{CockpitHandle, CockpitServer, Surface};
use m1cell_supervisor::{CellRegistry, Supervisor, SupervisorServer, scan_serial_ports};
use m1cell_types::CellError;
use m1cell_types::config::{self, ModuleConfig};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::signal::shutdown_signal;

fn socket_addr(host: &str, port: u16, what: &str) -> Result<SocketAddr, CellError> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| CellError::Config(format!("{what}: invalid address {host}:{port}: {e}")))
}

// ── bus ─────────────────────────────────────────────────────────────────────

pub async fn run_bus(bind: SocketAddr, registers: u16) -> Result<(), CellError> {
    if registers == 0 {
        return Err(CellError::Config("--registers must be at least 1".into()));
    }
    let handle = BusServer::new(Arc::new(RegisterBank::new(registers)))
        .spawn(bind)
        .await?;
    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

// ── bridge ──────────────────────────────────────────────────────────────────

/// A configured serial port must exist before the bridge takes ownership
/// of it.  Transient disappearance later is handled by the fast loop.
fn check_serial_port(cfg: &ModuleConfig) -> Result<(), CellError> {
    if cfg.device.simulate {
        return Ok(());
    }
    let port = cfg.serial.port.trim();
    let known = if port.starts_with('/') {
        Path::new(port).exists()
    } else {
        scan_serial_ports().iter().any(|p| p.port_name == port)
    };
    if known {
        Ok(())
    } else {
        Err(CellError::Config(format!("serial port {port} not found")))
    }
}

async fn spawn_surface(cfg: &ModuleConfig) -> Result<CockpitHandle, CellError> {
    let addr = socket_addr(&cfg.web.bind, cfg.web.port, "web")?;
    CockpitServer::new(Arc::new(Surface::from_config(cfg)))
        .spawn(addr)
        .await
}

pub async fn run_bridge(path: &Path) -> Result<(), CellError> {
    let cfg = config::load_from(path)?;
    check_serial_port(&cfg)?;
    let bridge = Bridge::from_config(&cfg)?;

    let web = if cfg.web.enabled {
        Some(spawn_surface(&cfg).await?)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fast_loop = tokio::spawn(bridge.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = fast_loop.await {
        warn!(module = %cfg.module_id, error = %e, "fast loop task failed");
    }
    if let Some(web) = web {
        web.shutdown().await;
    }
    info!(module = %cfg.module_id, "bridge stopped");
    Ok(())
}

// ── web ─────────────────────────────────────────────────────────────────────

pub async fn run_web(path: &Path) -> Result<(), CellError> {
    let cfg = config::load_from(path)?;
    let handle = spawn_surface(&cfg).await?;
    if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
        println!("  Web surface at {}", format!("http://{}", handle.local_addr()).bold());
    }
    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

// ── supervisor ──────────────────────────────────────────────────────────────

pub async fn run_supervisor(path: &Path, port: Option<u16>) -> Result<(), CellError> {
    let registry = CellRegistry::load(path)?;
    let addr = socket_addr(
        &registry.supervisor.bind,
        port.unwrap_or(registry.supervisor.port),
        "supervisor",
    )?;
    let handle = SupervisorServer::new(Arc::new(Supervisor::new(registry)))
        .spawn(addr)
        .await?;
    if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
        println!("  Dashboard API at {}", format!("http://{}", handle.local_addr()).bold());
    }
    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

// ── ports ───────────────────────────────────────────────────────────────────

pub fn run_ports(json: bool) -> Result<(), CellError> {
    let ports = scan_serial_ports();
    if json {
        let out = serde_json::to_string_pretty(&ports)
            .map_err(|e| CellError::Io(format!("failed to serialise port list: {e}")))?;
        println!("{out}");
        return Ok(());
    }
    if ports.is_empty() {
        println!("{}", "No serial ports found.".yellow());
        return Ok(());
    }
    for p in &ports {
        match &p.description {
            Some(desc) => println!("  {}  {}  {}", p.port_name.bold(), p.port_type.dimmed(), desc),
            None => println!("  {}  {}", p.port_name.bold(), p.port_type.dimmed()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use m1cell_types::DeviceKind;

    #[test]
    fn missing_serial_port_is_a_config_error() {
        let mut cfg = ModuleConfig::new("pgc", DeviceKind::PgcGripper, 540);
        cfg.serial.port = "/dev/m1cell-does-not-exist".into();
        assert!(matches!(check_serial_port(&cfg), Err(CellError::Config(_))));

        cfg.device.simulate = true;
        assert!(check_serial_port(&cfg).is_ok());
    }

    #[test]
    fn addresses_are_validated() {
        assert!(socket_addr("127.0.0.1", 8100, "web").is_ok());
        assert!(matches!(
            socket_addr("not a host", 8100, "web"),
            Err(CellError::Config(_))
        ));
    }

    #[test]
    fn bridge_with_bad_config_fails_fast() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("led.toml");
        std::fs::write(&path, "module_id = \"led\"\n[mapping]\nstatus_base = 500\n")?;
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let result = rt.block_on(run_bridge(&path));
        assert!(matches!(result, Err(CellError::Config(_))));
        Ok(())
    }
}
