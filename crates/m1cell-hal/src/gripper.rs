//! [`PgcGripper`] – electric parallel gripper with a DH-style register map.
//!
//! Motion is asynchronous: a move writes the target and returns.  Progress
//! is observed through the grip-state register on later polls.
//!
//! | Register | Meaning |
//! |---|---|
//! | `0x0100` | write 1 to (re)initialise; also clears faults |
//! | `0x0101` | force, percent (20..=100) |
//! | `0x0103` | target position, permille of stroke (0..=1000) |
//! | `0x0104` | speed, percent (1..=100) |
//! | `0x0200` | init state: 0 not initialised, 1 done |
//! | `0x0201` | grip state: 0 moving, 1 reached, 2 object caught, 3 object dropped |
//! | `0x0202` | position feedback |
//! | `0x0205` | fault code |

use async_trait::async_trait;
use m1cell_types::layout::{gripper, opcode};
use m1cell_types::{CellError, CommandRecord, DeviceKind, StatusWindow};
use tracing::debug;

use crate::device::{Device, DeviceStatus, OpcodeSpec, ParamRule};
use crate::link::DeviceLink;
use crate::sim::SimLink;

pub const REG_INIT: u16 = 0x0100;
pub const REG_FORCE: u16 = 0x0101;
pub const REG_POSITION: u16 = 0x0103;
pub const REG_SPEED: u16 = 0x0104;
pub const REG_INIT_STATE: u16 = 0x0200;
pub const REG_GRIP_STATE: u16 = 0x0201;
pub const REG_FEEDBACK: u16 = 0x0202;
pub const REG_FAULT: u16 = 0x0205;

pub const MAX_POSITION: u16 = 1000;

const GRIP_MOVING: u16 = 0;
/// Opcode 8 sets speed on the gripper; it has no homing.
const SET_SPEED: u16 = 8;

static OPCODES: &[OpcodeSpec] = &[
    OpcodeSpec::bare(opcode::INIT, "initialise"),
    OpcodeSpec::bare(opcode::STOP, "stop"),
    OpcodeSpec::new(
        opcode::MOVE_ABSOLUTE,
        "move_absolute",
        ParamRule::Range { min: 0, max: MAX_POSITION },
        ParamRule::Ignored,
    ),
    OpcodeSpec::new(opcode::MOVE_RELATIVE, "move_relative", ParamRule::Signed, ParamRule::Ignored),
    OpcodeSpec::new(
        opcode::SET_PARAM,
        "set_force",
        ParamRule::Required { min: 20, max: 100 },
        ParamRule::Ignored,
    ),
    OpcodeSpec::bare(opcode::EMERGENCY_STOP, "emergency_stop"),
    OpcodeSpec::bare(opcode::RESET_ERROR, "reset_error"),
    OpcodeSpec::new(
        SET_SPEED,
        "set_speed",
        ParamRule::Required { min: 1, max: 100 },
        ParamRule::Ignored,
    ),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GripperStatus {
    pub init_state: u16,
    pub grip_state: u16,
    pub position: u16,
    pub target: u16,
    pub force: u16,
    pub speed: u16,
    pub fault: u16,
}

impl GripperStatus {
    /// Jaws are travelling.  `grip_state` reads "moving" before init too,
    /// so an uninitialised gripper never counts as in motion.
    pub fn in_motion(&self) -> bool {
        self.init_state != 0 && self.grip_state == GRIP_MOVING
    }

    pub fn motion_complete(&self) -> bool {
        !self.in_motion()
    }

    pub fn encode(&self, window: &mut StatusWindow) {
        window.set_device(gripper::INIT_STATE, self.init_state);
        window.set_device(gripper::GRIP_STATE, self.grip_state);
        window.set_device(gripper::POSITION, self.position);
        window.set_device(gripper::TARGET, self.target);
        window.set_device(gripper::FORCE, self.force);
        window.set_device(gripper::SPEED, self.speed);
        window.set_device_bool(gripper::MOTION_COMPLETE, self.motion_complete());
        window.set_device(gripper::DEVICE_FAULT, self.fault);
    }
}

#[derive(Default)]
pub struct PgcGripper {
    status: GripperStatus,
}

impl PgcGripper {
    pub fn new() -> Self {
        Self::default()
    }

    async fn move_to(&mut self, link: &mut dyn DeviceLink, target: u16) -> Result<(), CellError> {
        if self.status.init_state == 0 {
            return Err(CellError::NotReady("gripper not initialised".into()));
        }
        link.write_register(REG_POSITION, target).await?;
        self.status.target = target;
        self.status.grip_state = GRIP_MOVING;
        debug!(target, "gripper move");
        Ok(())
    }

    /// Re-target the current position, which halts the jaws in place.
    async fn hold(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError> {
        let here = link.read_registers(REG_FEEDBACK, 1).await?;
        let here = here.first().copied().unwrap_or(self.status.position);
        link.write_register(REG_POSITION, here).await?;
        self.status.position = here;
        self.status.target = here;
        Ok(())
    }
}

#[async_trait]
impl Device for PgcGripper {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PgcGripper
    }

    fn opcodes(&self) -> &'static [OpcodeSpec] {
        OPCODES
    }

    /// Pick up the configured force, target and speed before the first poll.
    async fn connect(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError> {
        let regs = link.read_registers(REG_FORCE, REG_SPEED - REG_FORCE + 1).await?;
        if let [force, _, target, speed] = regs[..] {
            self.status.force = force;
            self.status.target = target;
            self.status.speed = speed;
        }
        self.poll(link).await
    }

    async fn poll(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError> {
        let regs = link
            .read_registers(REG_INIT_STATE, REG_FAULT - REG_INIT_STATE + 1)
            .await?;
        let at = |addr: u16| regs.get(usize::from(addr - REG_INIT_STATE)).copied().unwrap_or(0);
        self.status.init_state = at(REG_INIT_STATE);
        self.status.grip_state = at(REG_GRIP_STATE);
        self.status.position = at(REG_FEEDBACK);
        self.status.fault = at(REG_FAULT);
        Ok(())
    }

    async fn execute(
        &mut self,
        link: &mut dyn DeviceLink,
        cmd: &CommandRecord,
    ) -> Result<(), CellError> {
        match cmd.opcode {
            opcode::INIT | opcode::RESET_ERROR => {
                link.write_register(REG_INIT, 1).await?;
                self.status.fault = 0;
                Ok(())
            }
            opcode::STOP | opcode::EMERGENCY_STOP => self.hold(link).await,
            opcode::MOVE_ABSOLUTE => self.move_to(link, cmd.param1).await,
            opcode::MOVE_RELATIVE => {
                let delta = i32::from(cmd.param1 as i16);
                let target = (i32::from(self.status.position) + delta)
                    .clamp(0, i32::from(MAX_POSITION)) as u16;
                self.move_to(link, target).await
            }
            opcode::SET_PARAM => {
                link.write_register(REG_FORCE, cmd.param1).await?;
                self.status.force = cmd.param1;
                Ok(())
            }
            SET_SPEED => {
                link.write_register(REG_SPEED, cmd.param1).await?;
                self.status.speed = cmd.param1;
                Ok(())
            }
            other => Err(CellError::UnknownOpcode(other)),
        }
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::Gripper(self.status.clone())
    }
}

/// Simulated gripper.  Starts uninitialised; init completes instantly and
/// every target is reached immediately.
pub fn sim_link() -> SimLink {
    let link = SimLink::new()
        .on_write(REG_INIT, |regs, value| {
            if value != 0 {
                regs.set(REG_INIT_STATE, 1);
                regs.set(REG_GRIP_STATE, 1);
                regs.set(REG_FAULT, 0);
            }
        })
        .on_write(REG_POSITION, |regs, value| {
            regs.set(REG_FEEDBACK, value);
            regs.set(REG_GRIP_STATE, 1);
        });
    link.preset(REG_FORCE, 50);
    link.preset(REG_SPEED, 50);
    link
}
