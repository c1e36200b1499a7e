//! `m1cell-types` – shared vocabulary of the M1 cell control plane.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! * [`CellError`] – the single error taxonomy, with a stable numeric
//!   [`ErrorCode`] for each kind so that failures can be published into a
//!   status window.
//! * [`ModuleState`] / [`DeviceKind`] – small enums shared by bridges, web
//!   surfaces and the supervisor.
//! * [`layout`] – register window geometry, the typed [`StatusWindow`] view
//!   and the [`CommandRecord`] handshake tuple.
//! * [`config`] – the on-disk module configuration document.

pub mod config;
pub mod layout;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use layout::{CommandRecord, RegisterWindow, StatusWindow};

// ────────────────────────────────────────────────────────────────────────────
// Module state
// ────────────────────────────────────────────────────────────────────────────

/// Coarse module state published at offset 0 of every status window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ModuleState {
    Offline = 0,
    Idle = 1,
    Busy = 2,
    Error = 3,
}

impl ModuleState {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Offline),
            1 => Some(Self::Idle),
            2 => Some(Self::Busy),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device kinds
// ────────────────────────────────────────────────────────────────────────────

/// Physical device families a Device Bridge can own.
///
/// The linear stage, rotary platform and angle-adjustment motor share one
/// motion-axis implementation with different register profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    LedController,
    PgcGripper,
    LinearStage,
    RotaryPlatform,
    AngleMotor,
    VibrationPlate,
}

impl DeviceKind {
    /// `true` for the kinds driven by the generic motion-axis device.
    pub fn is_axis(self) -> bool {
        matches!(
            self,
            Self::LinearStage | Self::RotaryPlatform | Self::AngleMotor
        )
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LedController => "led_controller",
            Self::PgcGripper => "pgc_gripper",
            Self::LinearStage => "linear_stage",
            Self::RotaryPlatform => "rotary_platform",
            Self::AngleMotor => "angle_motor",
            Self::VibrationPlate => "vibration_plate",
        };
        f.write_str(name)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Error codes
// ────────────────────────────────────────────────────────────────────────────

/// Numeric outcome published in the `last_error_code` status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ErrorCode {
    #[default]
    Ok = 0,
    NoDevice = 1,
    IllegalOpcode = 2,
    ParamOutOfRange = 3,
    DeviceTimeout = 4,
    DeviceProtocol = 5,
    TornCommand = 6,
    FaultActive = 7,
    DeviceException = 8,
    NotReady = 9,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::Ok,
            1 => Self::NoDevice,
            2 => Self::IllegalOpcode,
            3 => Self::ParamOutOfRange,
            4 => Self::DeviceTimeout,
            5 => Self::DeviceProtocol,
            6 => Self::TornCommand,
            7 => Self::FaultActive,
            8 => Self::DeviceException,
            9 => Self::NotReady,
            _ => return None,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CellError
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning configuration, bus, device and process failures.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Register Bus Unreachable: {0}")]
    BusUnreachable(String),

    #[error("Register Bus Exception: code {0:#04x}")]
    BusException(u8),

    #[error("Device Unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Device Timeout: {0}")]
    DeviceTimeout(String),

    #[error("Device Protocol Error: {0}")]
    DeviceProtocol(String),

    #[error("Device Exception: code {0:#04x}")]
    DeviceException(u8),

    #[error("Illegal Command: unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("Illegal Command: opcode {opcode} {param} = {value} out of range")]
    ParamOutOfRange {
        opcode: u16,
        param: String,
        value: i64,
    },

    #[error("Torn Command: command {0} params never settled")]
    TornCommand(u16),

    #[error("Device Fault Active: code {0}")]
    FaultActive(u16),

    #[error("Device Not Ready: {0}")]
    NotReady(String),

    #[error("Process Error: {0}")]
    Process(String),

    #[error("I/O Error: {0}")]
    Io(String),
}

impl CellError {
    /// Map the error to the code published in `last_error_code`.
    pub fn code(&self) -> ErrorCode {
        match self {
            CellError::DeviceUnreachable(_) => ErrorCode::NoDevice,
            CellError::UnknownOpcode(_) => ErrorCode::IllegalOpcode,
            CellError::ParamOutOfRange { .. } => ErrorCode::ParamOutOfRange,
            CellError::DeviceTimeout(_) => ErrorCode::DeviceTimeout,
            CellError::DeviceProtocol(_) => ErrorCode::DeviceProtocol,
            CellError::DeviceException(_) => ErrorCode::DeviceException,
            CellError::TornCommand(_) => ErrorCode::TornCommand,
            CellError::FaultActive(_) => ErrorCode::FaultActive,
            CellError::NotReady(_) => ErrorCode::NotReady,
            CellError::Config(_)
            | CellError::BusUnreachable(_)
            | CellError::BusException(_)
            | CellError::Process(_)
            | CellError::Io(_) => ErrorCode::DeviceProtocol,
        }
    }

    /// `true` when the failure points at the device link rather than at
    /// the command.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            CellError::DeviceUnreachable(_)
                | CellError::DeviceTimeout(_)
                | CellError::DeviceProtocol(_)
        )
    }
}

impl From<std::io::Error> for CellError {
    fn from(e: std::io::Error) -> Self {
        CellError::Io(e.to_string())
    }
}
