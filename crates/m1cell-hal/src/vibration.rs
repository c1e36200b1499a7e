//! [`VibrationPlate`] – flexible feeder with a backlight.
//!
//! | Register | Meaning |
//! |---|---|
//! | `0x0000` | run (0/1) |
//! | `0x0001` | frequency, Hz (1..=300) |
//! | `0x0002` | amplitude, percent |
//! | `0x0003` | backlight on (0/1) |
//! | `0x0004` | backlight brightness (0..=1000) |
//! | `0x0010` | fault code |
//! | `0x0011` | write 1 to clear the fault |

use async_trait::async_trait;
use m1cell_types::layout::{opcode, vibration};
use m1cell_types::{CellError, CommandRecord, DeviceKind, StatusWindow};

use crate::device::{Device, DeviceStatus, OpcodeSpec, ParamRule};
use crate::link::DeviceLink;
use crate::sim::SimLink;

pub const REG_RUN: u16 = 0x0000;
pub const REG_FREQUENCY: u16 = 0x0001;
pub const REG_AMPLITUDE: u16 = 0x0002;
pub const REG_BACKLIGHT: u16 = 0x0003;
pub const REG_BACKLIGHT_BRIGHTNESS: u16 = 0x0004;
pub const REG_FAULT: u16 = 0x0010;
pub const REG_RESET: u16 = 0x0011;

const BACKLIGHT: u16 = 3;

static OPCODES: &[OpcodeSpec] = &[
    OpcodeSpec::bare(opcode::INIT, "start"),
    OpcodeSpec::bare(opcode::STOP, "stop"),
    OpcodeSpec::new(
        BACKLIGHT,
        "backlight",
        ParamRule::Range { min: 0, max: 1 },
        ParamRule::Range { min: 0, max: 1000 },
    ),
    OpcodeSpec::new(
        opcode::SET_PARAM,
        "set_vibration",
        ParamRule::Required { min: 1, max: 300 },
        ParamRule::Range { min: 0, max: 100 },
    ),
    OpcodeSpec::bare(opcode::EMERGENCY_STOP, "emergency_stop"),
    OpcodeSpec::bare(opcode::RESET_ERROR, "reset_error"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VibrationStatus {
    pub running: bool,
    pub frequency: u16,
    pub amplitude: u16,
    pub backlight_on: bool,
    pub backlight_brightness: u16,
    pub fault: u16,
}

impl VibrationStatus {
    pub fn encode(&self, window: &mut StatusWindow) {
        window.set_device_bool(vibration::RUNNING, self.running);
        window.set_device(vibration::FREQUENCY, self.frequency);
        window.set_device(vibration::AMPLITUDE, self.amplitude);
        window.set_device_bool(vibration::BACKLIGHT_ON, self.backlight_on);
        window.set_device(vibration::BACKLIGHT_BRIGHTNESS, self.backlight_brightness);
        window.set_device(vibration::DEVICE_FAULT, self.fault);
    }
}

#[derive(Default)]
pub struct VibrationPlate {
    status: VibrationStatus,
}

impl VibrationPlate {
    pub fn new() -> Self {
        Self::default()
    }

    async fn set_running(&mut self, link: &mut dyn DeviceLink, run: bool) -> Result<(), CellError> {
        link.write_register(REG_RUN, u16::from(run)).await?;
        self.status.running = run;
        Ok(())
    }
}

#[async_trait]
impl Device for VibrationPlate {
    fn kind(&self) -> DeviceKind {
        DeviceKind::VibrationPlate
    }

    fn opcodes(&self) -> &'static [OpcodeSpec] {
        OPCODES
    }

    async fn poll(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError> {
        let regs = link.read_registers(REG_RUN, REG_BACKLIGHT_BRIGHTNESS + 1).await?;
        let fault = link.read_registers(REG_FAULT, 1).await?;
        let at = |addr: u16| regs.get(usize::from(addr)).copied().unwrap_or(0);
        self.status = VibrationStatus {
            running: at(REG_RUN) != 0,
            frequency: at(REG_FREQUENCY),
            amplitude: at(REG_AMPLITUDE),
            backlight_on: at(REG_BACKLIGHT) != 0,
            backlight_brightness: at(REG_BACKLIGHT_BRIGHTNESS),
            fault: fault.first().copied().unwrap_or(0),
        };
        Ok(())
    }

    async fn execute(
        &mut self,
        link: &mut dyn DeviceLink,
        cmd: &CommandRecord,
    ) -> Result<(), CellError> {
        match cmd.opcode {
            opcode::INIT => self.set_running(link, true).await,
            opcode::STOP | opcode::EMERGENCY_STOP => self.set_running(link, false).await,
            BACKLIGHT => {
                link.write_registers(REG_BACKLIGHT, &[cmd.param1, cmd.param2])
                    .await?;
                self.status.backlight_on = cmd.param1 != 0;
                self.status.backlight_brightness = cmd.param2;
                Ok(())
            }
            opcode::SET_PARAM => {
                link.write_registers(REG_FREQUENCY, &[cmd.param1, cmd.param2])
                    .await?;
                self.status.frequency = cmd.param1;
                self.status.amplitude = cmd.param2;
                Ok(())
            }
            opcode::RESET_ERROR => {
                link.write_register(REG_RESET, 1).await?;
                self.status.fault = 0;
                Ok(())
            }
            other => Err(CellError::UnknownOpcode(other)),
        }
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::Vibration(self.status.clone())
    }
}

/// Simulated plate at 50 Hz / 30 %, stopped, backlight off.
pub fn sim_link() -> SimLink {
    let link = SimLink::new().on_write(REG_RESET, |regs, value| {
        if value == 1 {
            regs.set(REG_FAULT, 0);
        }
        regs.set(REG_RESET, 0);
    });
    link.preset(REG_FREQUENCY, 50);
    link.preset(REG_AMPLITUDE, 30);
    link
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Verdict, check_command};

    #[tokio::test]
    async fn start_and_tune() -> Result<(), CellError> {
        let mut link = sim_link();
        let mut plate = VibrationPlate::new();
        plate.connect(&mut link).await?;
        plate.execute(&mut link, &CommandRecord::new(5, 120, 80, 1)).await?;
        plate.execute(&mut link, &CommandRecord::new(1, 0, 0, 2)).await?;
        plate.poll(&mut link).await?;

        let mut window = StatusWindow::new();
        plate.status().encode(&mut window);
        assert_eq!(window.device(vibration::RUNNING), 1);
        assert_eq!(window.device(vibration::FREQUENCY), 120);
        assert_eq!(window.device(vibration::AMPLITUDE), 80);
        Ok(())
    }

    #[tokio::test]
    async fn backlight_writes_both_registers() -> Result<(), CellError> {
        let mut link = sim_link();
        let mut plate = VibrationPlate::new();
        plate.execute(&mut link, &CommandRecord::new(3, 1, 750, 1)).await?;
        assert_eq!(link.read_registers(REG_BACKLIGHT, 2).await?, vec![1, 750]);
        assert_eq!(link.write_log().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn fault_reported_and_reset() -> Result<(), CellError> {
        let mut link = sim_link();
        link.preset(REG_FAULT, 2);
        let mut plate = VibrationPlate::new();
        plate.poll(&mut link).await?;
        assert_eq!(plate.status().fault(), Some(2));
        plate.execute(&mut link, &CommandRecord::new(7, 0, 0, 1)).await?;
        plate.poll(&mut link).await?;
        assert_eq!(plate.status().fault(), None);
        Ok(())
    }

    #[test]
    fn frequency_bounds() {
        let plate = VibrationPlate::new();
        let table = plate.opcodes();
        assert_eq!(
            check_command(table, &CommandRecord::new(5, 0, 10, 1)),
            Ok(Verdict::Unsettled)
        );
        assert!(check_command(table, &CommandRecord::new(5, 301, 10, 1)).is_err());
        assert!(check_command(table, &CommandRecord::new(4, 0, 0, 1)).is_err());
    }
}
