//! # m1cell-cockpit
//!
//! The Web Control Surface of one module: a thin HTTP + WebSocket server
//! that is a pure Register Bus client.  It reads the module's status window
//! for display and writes its command window for control; it never talks
//! to the device.
//!
//! - [`surface`] – bus connection, degraded mode, status decoding, command
//!   submission.
//! - [`allocator`] – fresh `command_id` values.
//! - [`server`] – axum routes and the `/ws` push socket.

pub mod allocator;
pub mod server;
pub mod surface;

pub use allocator::CommandIdAllocator;
pub use server::{ApiError, CockpitHandle, CockpitServer, DEFAULT_PORT, router};
pub use surface::{CommandAck, CommandRequest, DecodedStatus, PushFrame, StatusReport, Surface, SurfaceConfig};
