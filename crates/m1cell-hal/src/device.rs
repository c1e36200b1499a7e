//! The [`Device`] trait and opcode tables.
//!
//! A device is a value that knows its family's register map.  The fast loop
//! is generic over it and only ever calls four things: `connect`, `poll`,
//! `execute` and `status`.
//!
//! Before a command reaches [`Device::execute`] the bridge runs
//! [`check_command`] against the family's [`OpcodeSpec`] table.  Rules are
//! evaluated in order and the first violation rejects the command.

use async_trait::async_trait;
use m1cell_types::{CellError, CommandRecord, DeviceKind, StatusWindow};

use crate::axis::AxisStatus;
use crate::gripper::GripperStatus;
use crate::led::LedStatus;
use crate::link::DeviceLink;
use crate::vibration::VibrationStatus;

// ────────────────────────────────────────────────────────────────────────────
// Opcode tables
// ────────────────────────────────────────────────────────────────────────────

/// Constraint on one command parameter register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRule {
    /// Not read by this opcode.
    Ignored,
    /// Unsigned value in `min..=max`.
    Range { min: u16, max: u16 },
    /// Unsigned value in `min..=max` where zero is never legal, so a zero
    /// read means the client's write has not fully landed yet.
    Required { min: u16, max: u16 },
    /// Any value, read as a signed 16-bit integer.
    Signed,
    /// `param1`/`param2` together form one signed 32-bit value.  The device
    /// checks it against its own limits.
    Wide,
}

/// One row of a family's opcode table.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeSpec {
    pub opcode: u16,
    pub name: &'static str,
    pub param1: ParamRule,
    pub param2: ParamRule,
}

impl OpcodeSpec {
    pub const fn new(opcode: u16, name: &'static str, param1: ParamRule, param2: ParamRule) -> Self {
        Self {
            opcode,
            name,
            param1,
            param2,
        }
    }

    pub const fn bare(opcode: u16, name: &'static str) -> Self {
        Self::new(opcode, name, ParamRule::Ignored, ParamRule::Ignored)
    }
}

/// Outcome of [`check_command`] for a well-formed opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Parameters are in range; execute now.
    Ready,
    /// A required parameter still reads zero; re-read next tick.
    Unsettled,
}

/// Validate `cmd` against `table`.
///
/// # Errors
///
/// * [`CellError::UnknownOpcode`] – the opcode has no table row.
/// * [`CellError::ParamOutOfRange`] – a parameter violates its rule.
pub fn check_command(table: &[OpcodeSpec], cmd: &CommandRecord) -> Result<Verdict, CellError> {
    let spec = table
        .iter()
        .find(|s| s.opcode == cmd.opcode)
        .ok_or(CellError::UnknownOpcode(cmd.opcode))?;

    let mut verdict = Verdict::Ready;
    for (name, rule, value) in [
        ("param1", spec.param1, cmd.param1),
        ("param2", spec.param2, cmd.param2),
    ] {
        match rule {
            ParamRule::Required { .. } if value == 0 => verdict = Verdict::Unsettled,
            ParamRule::Range { min, max } | ParamRule::Required { min, max }
                if !(min..=max).contains(&value) =>
            {
                return Err(CellError::ParamOutOfRange {
                    opcode: cmd.opcode,
                    param: name.to_string(),
                    value: i64::from(value),
                });
            }
            _ => {}
        }
    }
    Ok(verdict)
}

/// Look up the human-readable name of `opcode`.
pub fn opcode_name(table: &[OpcodeSpec], opcode: u16) -> &'static str {
    table
        .iter()
        .find(|s| s.opcode == opcode)
        .map(|s| s.name)
        .unwrap_or("unknown")
}

// ────────────────────────────────────────────────────────────────────────────
// Status
// ────────────────────────────────────────────────────────────────────────────

/// Cached device snapshot, one variant per family.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceStatus {
    Led(LedStatus),
    Gripper(GripperStatus),
    Axis(AxisStatus),
    Vibration(VibrationStatus),
}

impl DeviceStatus {
    /// Write the family-specific fields into `window`.
    pub fn encode(&self, window: &mut StatusWindow) {
        match self {
            DeviceStatus::Led(s) => s.encode(window),
            DeviceStatus::Gripper(s) => s.encode(window),
            DeviceStatus::Axis(s) => s.encode(window),
            DeviceStatus::Vibration(s) => s.encode(window),
        }
    }

    /// Non-zero device-reported fault code, if any.
    pub fn fault(&self) -> Option<u16> {
        let code = match self {
            DeviceStatus::Led(s) => s.fault,
            DeviceStatus::Gripper(s) => s.fault,
            DeviceStatus::Axis(s) => s.alarm_code,
            DeviceStatus::Vibration(s) => s.fault,
        };
        (code != 0).then_some(code)
    }

    /// `true` while a physical motion started by an earlier command is
    /// still in progress.
    pub fn in_motion(&self) -> bool {
        match self {
            DeviceStatus::Gripper(s) => s.in_motion(),
            DeviceStatus::Axis(s) => s.in_motion,
            DeviceStatus::Led(_) | DeviceStatus::Vibration(_) => false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device trait
// ────────────────────────────────────────────────────────────────────────────

/// A physical device family driven through a [`DeviceLink`].
///
/// All methods receive the link by `&mut`, so two transactions for the same
/// device can never be in flight at once.
#[async_trait]
pub trait Device: Send {
    fn kind(&self) -> DeviceKind;

    /// The family's opcode table.
    fn opcodes(&self) -> &'static [OpcodeSpec];

    /// Bring the device to a known state after a (re)connect.  Defaults to a
    /// poll.
    async fn connect(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError> {
        self.poll(link).await
    }

    /// Refresh the cached snapshot from the device's status registers.
    async fn poll(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError>;

    /// Run one verified command.  Motion opcodes return as soon as the
    /// device accepted the target; progress shows in the status fields.
    async fn execute(
        &mut self,
        link: &mut dyn DeviceLink,
        cmd: &CommandRecord,
    ) -> Result<(), CellError>;

    /// The latest cached snapshot.
    fn status(&self) -> DeviceStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[OpcodeSpec] = &[
        OpcodeSpec::bare(1, "enable"),
        OpcodeSpec::new(
            4,
            "channel_on",
            ParamRule::Required { min: 1, max: 4 },
            ParamRule::Range { min: 0, max: 1000 },
        ),
        OpcodeSpec::new(5, "nudge", ParamRule::Signed, ParamRule::Ignored),
    ];

    #[test]
    fn known_opcode_with_valid_params_is_ready() {
        let cmd = CommandRecord::new(4, 2, 300, 1234);
        assert_eq!(check_command(TABLE, &cmd), Ok(Verdict::Ready));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let cmd = CommandRecord::new(9, 0, 0, 1);
        assert_eq!(check_command(TABLE, &cmd), Err(CellError::UnknownOpcode(9)));
    }

    #[test]
    fn out_of_range_param_names_the_param() {
        let cmd = CommandRecord::new(4, 2, 1001, 1);
        match check_command(TABLE, &cmd) {
            Err(CellError::ParamOutOfRange { param, value, .. }) => {
                assert_eq!(param, "param2");
                assert_eq!(value, 1001);
            }
            other => panic!("unexpected {other:?}"),
        }
        let cmd = CommandRecord::new(4, 5, 10, 1);
        assert!(check_command(TABLE, &cmd).is_err());
    }

    #[test]
    fn zero_required_param_is_unsettled() {
        let cmd = CommandRecord::new(4, 0, 300, 77);
        assert_eq!(check_command(TABLE, &cmd), Ok(Verdict::Unsettled));
    }

    #[test]
    fn signed_and_ignored_params_accept_anything() {
        let cmd = CommandRecord::new(5, 0xFFFF, 0xFFFF, 3);
        assert_eq!(check_command(TABLE, &cmd), Ok(Verdict::Ready));
        assert_eq!(opcode_name(TABLE, 5), "nudge");
        assert_eq!(opcode_name(TABLE, 42), "unknown");
    }
}
