//! # m1cell-bridge
//!
//! The Device Bridge: one task owning one physical device and one bus
//! connection, bridging the device to its status and command windows.
//!
//! - [`fast_loop`] – [`Bridge`], the reconnect → scan → execute → poll →
//!   publish tick.
//! - [`state`] – coarse bridge phases and the command counters.
//! - [`watchdog`] – device liveness deadlines.
//! - [`telemetry`] – tracing / OpenTelemetry set-up shared by every binary.

pub mod fast_loop;
pub mod state;
pub mod telemetry;
pub mod watchdog;

pub use fast_loop::{Bridge, BridgeConfig, CommandOutcome, DeferReason, TickReport, timestamp_lo};
pub use state::{BridgePhase, Counters};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use watchdog::{LinkHealth, Watchdog};
