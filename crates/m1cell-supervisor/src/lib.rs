//! Supervisor for an M1 automation cell.
//!
//! Owns the process lifecycle of every module listed in the cell registry
//! and serves a small HTTP API plus a dashboard WebSocket.  It observes
//! liveness at the process and socket level only and never reads or writes
//! the Register Bus.

pub mod api;
pub mod ports;
pub mod process;
pub mod registry;
pub mod supervisor;

pub use api::{SupervisorHandle, SupervisorServer, router};
pub use ports::{SerialPortEntry, port_accepts, scan_serial_ports};
pub use process::{ExitRecord, LaunchSpec, ProcessHandle, Stopping};
pub use registry::{BUS_ID, BusSettings, CellRegistry, ModuleEntry, SupervisorSettings};
pub use supervisor::{BusStatus, CellStatus, ModuleStatus, Supervisor, SupervisorError};
