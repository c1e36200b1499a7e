//! `m1cell` – one binary for every process of an M1 automation cell.
//!
//! | Subcommand | Process |
//! |---|---|
//! | `bus` | Register Bus (Modbus TCP holding registers) |
//! | `bridge` | Device Bridge for one module; also serves its web surface when `web.enabled` |
//! | `web` | standalone Web Control Surface for one module |
//! | `supervisor` | process supervisor and dashboard API |
//! | `ports` | list serial devices visible to the OS |
//!
//! Exit codes: `0` clean stop, `2` configuration error, `1` any other
//! initialisation failure.

mod commands;
mod signal;

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use m1cell_types::CellError;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "m1cell", version, about = "Dobot M1 automation cell control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Serve the Register Bus.
    Bus {
        #[arg(long, env = "M1CELL_BUS_BIND", default_value = "0.0.0.0:502")]
        bind: SocketAddr,
        /// Number of holding registers.
        #[arg(long, env = "M1CELL_BUS_REGISTERS", default_value_t = m1cell_types::layout::DEFAULT_REGISTER_COUNT)]
        registers: u16,
    },
    /// Run the Device Bridge for one module.
    Bridge {
        #[arg(long, env = "M1CELL_CONFIG")]
        config: PathBuf,
    },
    /// Run a standalone Web Control Surface for one module.
    Web {
        #[arg(long, env = "M1CELL_CONFIG")]
        config: PathBuf,
    },
    /// Supervise the modules listed in a cell registry.
    Supervisor {
        #[arg(long, env = "M1CELL_REGISTRY")]
        registry: PathBuf,
        /// Override `supervisor.port` from the registry.
        #[arg(long)]
        port: Option<u16>,
    },
    /// List serial devices.
    Ports {
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn service_name(&self) -> &'static str {
        match self {
            Command::Bus { .. } => "m1cell-bus",
            Command::Bridge { .. } => "m1cell-bridge",
            Command::Web { .. } => "m1cell-web",
            Command::Supervisor { .. } => "m1cell-supervisor",
            Command::Ports { .. } => "m1cell",
        }
    }

    fn is_service(&self) -> bool {
        !matches!(self, Command::Ports { .. })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = m1cell_bridge::init_tracing(cli.command.service_name());

    if cli.command.is_service() && std::io::stdout().is_terminal() {
        print_banner(cli.command.service_name());
    }

    let result = match cli.command {
        Command::Bus { bind, registers } => commands::run_bus(bind, registers).await,
        Command::Bridge { config } => commands::run_bridge(&config).await,
        Command::Web { config } => commands::run_web(&config).await,
        Command::Supervisor { registry, port } => commands::run_supervisor(&registry, port).await,
        Command::Ports { json } => commands::run_ports(json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "m1cell exiting");
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &CellError) -> u8 {
    match e {
        CellError::Config(_) => 2,
        _ => 1,
    }
}

fn print_banner(service: &str) {
    println!();
    println!("{}", r#"   __  _____        ____"#.bold().cyan());
    println!("{}", r#"  /  |/  <  /_______/ / /"#.bold().cyan());
    println!("{}", r#" / /|_/ // / __/ -_) / / "#.bold().cyan());
    println!("{}", r#"/_/  /_//_/\__/\__/_/_/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        service.bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Dobot M1 automation cell");
    println!();
}
