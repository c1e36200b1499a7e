//! # m1cell-hal
//!
//! The device side of a Device Bridge.
//!
//! - [`link`] – [`DeviceLink`] / [`LinkOpener`] traits and the Modbus RTU
//!   serial implementation.
//! - [`sim`] – shared in-memory register model used by tests and by
//!   `device.simulate = true`.
//! - [`device`] – the [`Device`] trait, opcode tables and [`check_command`].
//! - [`led`], [`gripper`], [`axis`], [`vibration`] – one driver per device
//!   family.
//! - [`registry`] – builds the driver and opener for a module configuration.

pub mod axis;
pub mod device;
pub mod gripper;
pub mod led;
pub mod link;
pub mod registry;
pub mod sim;
pub mod vibration;

pub use device::{Device, DeviceStatus, OpcodeSpec, ParamRule, Verdict, check_command, opcode_name};
pub use link::{DeviceLink, LinkOpener, SerialOpener, SerialSettings};
pub use registry::{build_device, build_opener, sim_link_for};
pub use sim::{SimLink, SimOpener};
