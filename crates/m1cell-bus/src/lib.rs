//! `m1cell-bus` – The Register Bus
//!
//! The single rendezvous between modules and UIs: a flat array of 16-bit
//! holding registers served over Modbus TCP.
//!
//! # Modules
//!
//! - [`bank`] – the register array, atomic per request.
//! - [`server`] – Modbus TCP server with bounded idle close and graceful
//!   shutdown of live connections.
//! - [`client`] – the [`RegisterIo`] seam, a Modbus TCP client and an
//!   in-process client, plus [`BusConnector`] factories.
//! - [`backoff`] – bounded exponential reconnect pacing.

pub mod backoff;
pub mod bank;
pub mod client;
pub mod server;

pub use backoff::Backoff;
pub use bank::RegisterBank;
pub use client::{BusClient, BusConnector, LocalBus, LocalConnector, RegisterIo, TcpConnector};
pub use server::{BusServer, BusServerHandle, DEFAULT_PORT};
