//! [`MotionAxis`] – single-axis positioners.
//!
//! The linear stage (XC100 controller), the rotary platform and the
//! angle-adjustment motor share one implementation.  They differ only in
//! where their register block starts and in their default soft limits, which
//! the [`AxisProfile`] captures.
//!
//! # Register block (relative to the profile base)
//!
//! | Offset | Meaning |
//! |---|---|
//! | `0x00` | enable (0/1) |
//! | `0x01` | control: 1 move, 2 home, 3 stop, 4 clear alarm |
//! | `0x02`, `0x03` | target lo/hi (i32) |
//! | `0x04` | speed |
//! | `0x10`, `0x11` | position lo/hi (i32) |
//! | `0x12` | in motion |
//! | `0x13` | homed |
//! | `0x14` | alarm code |

use async_trait::async_trait;
use m1cell_types::layout::{axis, join_i32, opcode, split_i32};
use m1cell_types::{CellError, CommandRecord, DeviceKind, StatusWindow};
use serde::Deserialize;
use tracing::debug;

use crate::device::{Device, DeviceStatus, OpcodeSpec, ParamRule};
use crate::link::DeviceLink;
use crate::sim::SimLink;

pub const OFF_ENABLE: u16 = 0x00;
pub const OFF_CONTROL: u16 = 0x01;
pub const OFF_TARGET: u16 = 0x02;
pub const OFF_SPEED: u16 = 0x04;
pub const OFF_POSITION: u16 = 0x10;
pub const OFF_IN_MOTION: u16 = 0x12;
pub const OFF_HOMED: u16 = 0x13;
pub const OFF_ALARM: u16 = 0x14;

const BLOCK_LEN: u16 = OFF_ALARM + 1;

pub const CTRL_MOVE: u16 = 1;
pub const CTRL_HOME: u16 = 2;
pub const CTRL_STOP: u16 = 3;
pub const CTRL_CLEAR: u16 = 4;

static OPCODES: &[OpcodeSpec] = &[
    OpcodeSpec::bare(opcode::INIT, "enable"),
    OpcodeSpec::bare(opcode::STOP, "stop"),
    OpcodeSpec::new(opcode::MOVE_ABSOLUTE, "move_absolute", ParamRule::Wide, ParamRule::Wide),
    OpcodeSpec::new(opcode::MOVE_RELATIVE, "move_relative", ParamRule::Wide, ParamRule::Wide),
    OpcodeSpec::new(
        opcode::SET_PARAM,
        "set_speed",
        ParamRule::Required { min: 1, max: u16::MAX },
        ParamRule::Ignored,
    ),
    OpcodeSpec::bare(opcode::EMERGENCY_STOP, "emergency_stop"),
    OpcodeSpec::bare(opcode::RESET_ERROR, "clear_alarm"),
    OpcodeSpec::bare(opcode::HOME, "home"),
];

// ────────────────────────────────────────────────────────────────────────────
// Profiles and options
// ────────────────────────────────────────────────────────────────────────────

/// Where a family's register block lives and its factory soft limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisProfile {
    pub name: &'static str,
    pub base: u16,
    pub min_position: i32,
    pub max_position: i32,
    pub max_speed: u16,
}

impl AxisProfile {
    /// XC100 linear stage, positions in µm.
    pub const LINEAR: AxisProfile = AxisProfile {
        name: "xc100",
        base: 0x0000,
        min_position: 0,
        max_position: 300_000,
        max_speed: 1000,
    };
    /// Rotary platform, positions in 0.01°.
    pub const ROTARY: AxisProfile = AxisProfile {
        name: "rotary",
        base: 0x0100,
        min_position: -36_000,
        max_position: 36_000,
        max_speed: 720,
    };
    /// Angle-adjustment motor, positions in 0.01°.
    pub const ANGLE: AxisProfile = AxisProfile {
        name: "angle_motor",
        base: 0x0200,
        min_position: -9_000,
        max_position: 9_000,
        max_speed: 300,
    };

    pub fn for_kind(kind: DeviceKind) -> Option<AxisProfile> {
        match kind {
            DeviceKind::LinearStage => Some(Self::LINEAR),
            DeviceKind::RotaryPlatform => Some(Self::ROTARY),
            DeviceKind::AngleMotor => Some(Self::ANGLE),
            _ => None,
        }
    }

    fn reg(&self, offset: u16) -> u16 {
        self.base + offset
    }
}

/// `[device]` options for an axis; unset fields keep the profile defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AxisOptions {
    pub min_position: Option<i32>,
    pub max_position: Option<i32>,
    pub max_speed: Option<u16>,
}

impl AxisOptions {
    pub fn apply(&self, mut profile: AxisProfile) -> Result<AxisProfile, CellError> {
        profile.min_position = self.min_position.unwrap_or(profile.min_position);
        profile.max_position = self.max_position.unwrap_or(profile.max_position);
        profile.max_speed = self.max_speed.unwrap_or(profile.max_speed);
        if profile.min_position > profile.max_position {
            return Err(CellError::Config(format!(
                "axis soft limits inverted: {} > {}",
                profile.min_position, profile.max_position
            )));
        }
        if profile.max_speed == 0 {
            return Err(CellError::Config("axis max_speed must be non-zero".into()));
        }
        Ok(profile)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AxisStatus {
    pub enabled: bool,
    pub position: i32,
    pub target: i32,
    pub in_motion: bool,
    pub homed: bool,
    pub speed: u16,
    pub alarm_code: u16,
}

impl AxisStatus {
    pub fn encode(&self, window: &mut StatusWindow) {
        window.set_device_bool(axis::ENABLED, self.enabled);
        window.set_device_i32(axis::POSITION, self.position);
        window.set_device_i32(axis::TARGET, self.target);
        window.set_device_bool(axis::IN_MOTION, self.in_motion);
        window.set_device_bool(axis::MOTION_COMPLETE, !self.in_motion);
        window.set_device_bool(axis::HOMED, self.homed);
        window.set_device(axis::SPEED, self.speed);
        window.set_device(axis::ALARM_CODE, self.alarm_code);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device
// ────────────────────────────────────────────────────────────────────────────

pub struct MotionAxis {
    kind: DeviceKind,
    profile: AxisProfile,
    status: AxisStatus,
}

impl MotionAxis {
    pub fn new(kind: DeviceKind, profile: AxisProfile) -> Self {
        Self {
            kind,
            profile,
            status: AxisStatus::default(),
        }
    }

    pub fn profile(&self) -> &AxisProfile {
        &self.profile
    }

    fn check_limits(&self, opcode: u16, target: i64) -> Result<i32, CellError> {
        let p = &self.profile;
        if target < i64::from(p.min_position) || target > i64::from(p.max_position) {
            return Err(CellError::ParamOutOfRange {
                opcode,
                param: "target".into(),
                value: target,
            });
        }
        Ok(target as i32)
    }

    fn require_enabled(&self) -> Result<(), CellError> {
        if self.status.enabled {
            Ok(())
        } else {
            Err(CellError::NotReady(format!("{} axis disabled", self.profile.name)))
        }
    }

    async fn control(&self, link: &mut dyn DeviceLink, code: u16) -> Result<(), CellError> {
        link.write_register(self.profile.reg(OFF_CONTROL), code).await
    }

    async fn move_to(&mut self, link: &mut dyn DeviceLink, target: i32) -> Result<(), CellError> {
        self.require_enabled()?;
        link.write_registers(self.profile.reg(OFF_TARGET), &split_i32(target))
            .await?;
        self.control(link, CTRL_MOVE).await?;
        self.status.target = target;
        self.status.in_motion = true;
        debug!(axis = self.profile.name, target, "axis move");
        Ok(())
    }
}

#[async_trait]
impl Device for MotionAxis {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn opcodes(&self) -> &'static [OpcodeSpec] {
        OPCODES
    }

    async fn poll(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError> {
        let regs = link.read_registers(self.profile.base, BLOCK_LEN).await?;
        let at = |off: u16| regs.get(usize::from(off)).copied().unwrap_or(0);
        self.status.enabled = at(OFF_ENABLE) != 0;
        self.status.target = join_i32(at(OFF_TARGET), at(OFF_TARGET + 1));
        self.status.speed = at(OFF_SPEED);
        self.status.position = join_i32(at(OFF_POSITION), at(OFF_POSITION + 1));
        self.status.in_motion = at(OFF_IN_MOTION) != 0;
        self.status.homed = at(OFF_HOMED) != 0;
        self.status.alarm_code = at(OFF_ALARM);
        Ok(())
    }

    async fn execute(
        &mut self,
        link: &mut dyn DeviceLink,
        cmd: &CommandRecord,
    ) -> Result<(), CellError> {
        match cmd.opcode {
            opcode::INIT => {
                link.write_register(self.profile.reg(OFF_ENABLE), 1).await?;
                self.status.enabled = true;
                Ok(())
            }
            opcode::STOP => {
                self.control(link, CTRL_STOP).await?;
                self.status.in_motion = false;
                Ok(())
            }
            opcode::MOVE_ABSOLUTE => {
                let target = self.check_limits(cmd.opcode, i64::from(cmd.param_i32()))?;
                self.move_to(link, target).await
            }
            opcode::MOVE_RELATIVE => {
                let target = i64::from(self.status.position) + i64::from(cmd.param_i32());
                let target = self.check_limits(cmd.opcode, target)?;
                self.move_to(link, target).await
            }
            opcode::SET_PARAM => {
                if cmd.param1 > self.profile.max_speed {
                    return Err(CellError::ParamOutOfRange {
                        opcode: cmd.opcode,
                        param: "param1".into(),
                        value: i64::from(cmd.param1),
                    });
                }
                link.write_register(self.profile.reg(OFF_SPEED), cmd.param1).await?;
                self.status.speed = cmd.param1;
                Ok(())
            }
            opcode::EMERGENCY_STOP => {
                self.control(link, CTRL_STOP).await?;
                link.write_register(self.profile.reg(OFF_ENABLE), 0).await?;
                self.status.in_motion = false;
                self.status.enabled = false;
                Ok(())
            }
            opcode::RESET_ERROR => {
                self.control(link, CTRL_CLEAR).await?;
                self.status.alarm_code = 0;
                Ok(())
            }
            opcode::HOME => {
                self.require_enabled()?;
                self.control(link, CTRL_HOME).await?;
                self.status.in_motion = true;
                self.status.target = 0;
                Ok(())
            }
            other => Err(CellError::UnknownOpcode(other)),
        }
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::Axis(self.status.clone())
    }
}

/// Simulated axis controller for `profile`.  Moves and homing complete
/// instantly; stop freezes motion; clear resets the alarm.
pub fn sim_link(profile: AxisProfile) -> SimLink {
    let base = profile.base;
    let link = SimLink::new().on_write(base + OFF_CONTROL, move |regs, code| {
        match code {
            CTRL_MOVE => {
                regs.set(base + OFF_POSITION, regs.get(base + OFF_TARGET));
                regs.set(base + OFF_POSITION + 1, regs.get(base + OFF_TARGET + 1));
            }
            CTRL_HOME => {
                regs.set(base + OFF_POSITION, 0);
                regs.set(base + OFF_POSITION + 1, 0);
                regs.set(base + OFF_HOMED, 1);
            }
            CTRL_CLEAR => regs.set(base + OFF_ALARM, 0),
            _ => {}
        }
        regs.set(base + OFF_IN_MOTION, 0);
        regs.set(base + OFF_CONTROL, 0);
    });
    link.preset(base + OFF_SPEED, profile.max_speed / 2);
    link
}
