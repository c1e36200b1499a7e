//! [`LedController`] – four-channel LED light source.
//!
//! # Device register map
//!
//! | Register | Meaning |
//! |---|---|
//! | `0x0000..=0x0003` | channel enable (0/1) |
//! | `0x0010..=0x0013` | channel brightness (0..=1000) |
//! | `0x0020` | temperature, 0.1 °C, signed |
//! | `0x0021` | fault code |
//! | `0x0030` | write 1 to clear the fault |
//!
//! Commands are synchronous: once the write is acknowledged the cached
//! status is updated without waiting for the next poll.

use async_trait::async_trait;
use m1cell_types::layout::{led, opcode};
use m1cell_types::{CellError, CommandRecord, DeviceKind, StatusWindow};
use serde::Deserialize;
use tracing::debug;

use crate::device::{Device, DeviceStatus, OpcodeSpec, ParamRule};
use crate::link::DeviceLink;
use crate::sim::SimLink;

pub const REG_ENABLE: u16 = 0x0000;
pub const REG_BRIGHTNESS: u16 = 0x0010;
pub const REG_TEMPERATURE: u16 = 0x0020;
pub const REG_FAULT: u16 = 0x0021;
pub const REG_RESET: u16 = 0x0030;

const CHANNELS: usize = led::CHANNELS as usize;
const CHANNEL: ParamRule = ParamRule::Required { min: 1, max: led::CHANNELS };
const BRIGHTNESS: ParamRule = ParamRule::Range { min: 0, max: 1000 };

static OPCODES: &[OpcodeSpec] = &[
    OpcodeSpec::bare(opcode::INIT, "enable_all"),
    OpcodeSpec::bare(opcode::STOP, "all_off"),
    OpcodeSpec::new(3, "channel_switch", CHANNEL, ParamRule::Range { min: 0, max: 1 }),
    OpcodeSpec::new(4, "channel_on_at", CHANNEL, BRIGHTNESS),
    OpcodeSpec::new(5, "set_brightness", CHANNEL, BRIGHTNESS),
    OpcodeSpec::bare(opcode::EMERGENCY_STOP, "emergency_stop"),
    OpcodeSpec::bare(opcode::RESET_ERROR, "reset_error"),
];

/// `[device]` options accepted by the LED controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedOptions {
    /// Brightness used by "enable all" for channels never given one.
    pub default_brightness: u16,
}

impl Default for LedOptions {
    fn default() -> Self {
        Self {
            default_brightness: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedStatus {
    pub channels: [bool; CHANNELS],
    pub brightness: [u16; CHANNELS],
    /// 0.1 °C.
    pub temperature: i16,
    pub fault: u16,
}

impl LedStatus {
    pub fn active_channels(&self) -> u16 {
        self.channels.iter().filter(|on| **on).count() as u16
    }

    pub fn encode(&self, window: &mut StatusWindow) {
        window.set_device(led::ACTIVE_CHANNELS, self.active_channels());
        for i in 0..CHANNELS {
            window.set_device_bool(led::CHANNEL_STATE + i, self.channels[i]);
            window.set_device(led::CHANNEL_BRIGHTNESS + i, self.brightness[i]);
        }
        window.set_device(led::TEMPERATURE, self.temperature as u16);
        window.set_device(led::DEVICE_FAULT, self.fault);
    }
}

pub struct LedController {
    status: LedStatus,
    options: LedOptions,
}

impl LedController {
    pub fn new(options: LedOptions) -> Self {
        Self {
            status: LedStatus::default(),
            options,
        }
    }

    fn index(channel: u16) -> usize {
        usize::from(channel.clamp(1, led::CHANNELS)) - 1
    }

    async fn write_enables(
        &mut self,
        link: &mut dyn DeviceLink,
        enables: [bool; CHANNELS],
    ) -> Result<(), CellError> {
        let regs = enables.map(u16::from);
        link.write_registers(REG_ENABLE, &regs).await?;
        self.status.channels = enables;
        Ok(())
    }

    async fn write_brightness(
        &mut self,
        link: &mut dyn DeviceLink,
        idx: usize,
        value: u16,
    ) -> Result<(), CellError> {
        link.write_register(REG_BRIGHTNESS + idx as u16, value).await?;
        self.status.brightness[idx] = value;
        Ok(())
    }
}

#[async_trait]
impl Device for LedController {
    fn kind(&self) -> DeviceKind {
        DeviceKind::LedController
    }

    fn opcodes(&self) -> &'static [OpcodeSpec] {
        OPCODES
    }

    async fn poll(&mut self, link: &mut dyn DeviceLink) -> Result<(), CellError> {
        let count = REG_FAULT - REG_ENABLE + 1;
        let regs = link.read_registers(REG_ENABLE, count).await?;
        let at = |addr: u16| regs.get(usize::from(addr - REG_ENABLE)).copied().unwrap_or(0);
        for i in 0..CHANNELS {
            self.status.channels[i] = at(REG_ENABLE + i as u16) != 0;
            self.status.brightness[i] = at(REG_BRIGHTNESS + i as u16);
        }
        self.status.temperature = at(REG_TEMPERATURE) as i16;
        self.status.fault = at(REG_FAULT);
        Ok(())
    }

    async fn execute(
        &mut self,
        link: &mut dyn DeviceLink,
        cmd: &CommandRecord,
    ) -> Result<(), CellError> {
        match cmd.opcode {
            opcode::INIT => {
                let mut levels = self.status.brightness;
                for level in levels.iter_mut().filter(|l| **l == 0) {
                    *level = self.options.default_brightness;
                }
                link.write_registers(REG_BRIGHTNESS, &levels).await?;
                self.status.brightness = levels;
                self.write_enables(link, [true; CHANNELS]).await
            }
            opcode::STOP | opcode::EMERGENCY_STOP => self.write_enables(link, [false; CHANNELS]).await,
            3 => {
                let idx = Self::index(cmd.param1);
                let on = cmd.param2 != 0;
                link.write_register(REG_ENABLE + idx as u16, u16::from(on)).await?;
                self.status.channels[idx] = on;
                Ok(())
            }
            4 => {
                let idx = Self::index(cmd.param1);
                self.write_brightness(link, idx, cmd.param2).await?;
                link.write_register(REG_ENABLE + idx as u16, 1).await?;
                self.status.channels[idx] = true;
                debug!(channel = cmd.param1, brightness = cmd.param2, "led channel on");
                Ok(())
            }
            5 => {
                let idx = Self::index(cmd.param1);
                self.write_brightness(link, idx, cmd.param2).await
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
        DeviceStatus::Led(self.status.clone())
    }
}

/// Simulated LED controller: 25.0 °C, no fault, reset register clears the
/// fault and reads back as 0.
pub fn sim_link() -> SimLink {
    let link = SimLink::new().on_write(REG_RESET, |regs, value| {
        if value == 1 {
            regs.set(REG_FAULT, 0);
        }
        regs.set(REG_RESET, 0);
    });
    link.preset(REG_TEMPERATURE, 250);
    link
}
