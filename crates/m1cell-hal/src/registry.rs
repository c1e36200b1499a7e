//! Device factory – turns a `[device]` section into a driver and a link opener.
//!
//! | `device.kind` | Driver | Simulated register model |
//! |---|---|---|
//! | `led_controller` | [`LedController`] | [`led::sim_link`] |
//! | `pgc_gripper` | [`PgcGripper`] | [`gripper::sim_link`] |
//! | `linear_stage`, `rotary_platform`, `angle_motor` | [`MotionAxis`] | [`axis::sim_link`] |
//! | `vibration_plate` | [`VibrationPlate`] | [`vibration::sim_link`] |
//!
//! With `device.simulate = true` the opener hands out links to the family's
//! simulated register model instead of opening `serial.port`.

use m1cell_types::config::{DeviceConfig, ModuleConfig};
use m1cell_types::{CellError, DeviceKind};
use tracing::info;

use crate::axis::{self, AxisOptions, AxisProfile, MotionAxis};
use crate::device::Device;
use crate::gripper::{self, PgcGripper};
use crate::led::{self, LedController, LedOptions};
use crate::link::{LinkOpener, SerialOpener, SerialSettings};
use crate::sim::{SimLink, SimOpener};
use crate::vibration::{self, VibrationPlate};

fn axis_profile(cfg: &DeviceConfig) -> Result<AxisProfile, CellError> {
    let base = AxisProfile::for_kind(cfg.kind)
        .ok_or_else(|| CellError::Config(format!("{} is not an axis", cfg.kind)))?;
    cfg.options_as::<AxisOptions>()?.apply(base)
}

/// Build the driver for `cfg.kind`, applying its family options.
///
/// # Errors
///
/// [`CellError::Config`] when the family options do not parse or are
/// inconsistent.
pub fn build_device(cfg: &DeviceConfig) -> Result<Box<dyn Device>, CellError> {
    Ok(match cfg.kind {
        DeviceKind::LedController => Box::new(LedController::new(cfg.options_as::<LedOptions>()?)),
        DeviceKind::PgcGripper => Box::new(PgcGripper::new()),
        DeviceKind::LinearStage | DeviceKind::RotaryPlatform | DeviceKind::AngleMotor => {
            Box::new(MotionAxis::new(cfg.kind, axis_profile(cfg)?))
        }
        DeviceKind::VibrationPlate => Box::new(VibrationPlate::new()),
    })
}

/// The simulated register model of a device family.
pub fn sim_link_for(cfg: &DeviceConfig) -> Result<SimLink, CellError> {
    Ok(match cfg.kind {
        DeviceKind::LedController => led::sim_link(),
        DeviceKind::PgcGripper => gripper::sim_link(),
        DeviceKind::LinearStage | DeviceKind::RotaryPlatform | DeviceKind::AngleMotor => {
            axis::sim_link(axis_profile(cfg)?)
        }
        DeviceKind::VibrationPlate => vibration::sim_link(),
    })
}

/// Build the link opener for a module: serial RTU, or the simulated model
/// when `device.simulate` is set.
pub fn build_opener(cfg: &ModuleConfig) -> Result<Box<dyn LinkOpener>, CellError> {
    if cfg.device.simulate {
        info!(module = %cfg.module_id, kind = %cfg.device.kind, "using simulated device");
        return Ok(Box::new(SimOpener::new(sim_link_for(&cfg.device)?)));
    }
    let settings = SerialSettings::from_config(
        &cfg.serial,
        cfg.device.slave_id,
        cfg.timing.serial_delay_ms,
    );
    Ok(Box::new(SerialOpener::new(settings)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(kind: DeviceKind, options: &str) -> DeviceConfig {
        let mut cfg = ModuleConfig::new("t", kind, 500).device;
        cfg.options = options.parse().expect("options table");
        cfg
    }

    #[test]
    fn builds_every_family() -> Result<(), CellError> {
        for kind in [
            DeviceKind::LedController,
            DeviceKind::PgcGripper,
            DeviceKind::LinearStage,
            DeviceKind::RotaryPlatform,
            DeviceKind::AngleMotor,
            DeviceKind::VibrationPlate,
        ] {
            let dev = build_device(&device(kind, ""))?;
            assert_eq!(dev.kind(), kind);
            assert!(!dev.opcodes().is_empty());
        }
        Ok(())
    }

    #[test]
    fn bad_axis_options_are_config_errors() {
        let cfg = device(DeviceKind::LinearStage, "min_position = 10\nmax_position = 0");
        assert!(matches!(build_device(&cfg), Err(CellError::Config(_))));
        let cfg = device(DeviceKind::LinearStage, "max_speed = \"fast\"");
        assert!(matches!(build_device(&cfg), Err(CellError::Config(_))));
    }

    #[tokio::test]
    async fn simulate_flag_selects_sim_opener() -> Result<(), CellError> {
        let mut cfg = ModuleConfig::new("led", DeviceKind::LedController, 500);
        cfg.device.simulate = true;
        let opener = build_opener(&cfg)?;
        assert_eq!(opener.describe(), "simulated");
        let mut link = opener.open().await?;
        assert_eq!(link.read_registers(led::REG_TEMPERATURE, 1).await?, vec![250]);
        Ok(())
    }

    #[test]
    fn real_device_uses_serial_port() -> Result<(), CellError> {
        let mut cfg = ModuleConfig::new("pgc", DeviceKind::PgcGripper, 540);
        cfg.serial.port = "/dev/ttyUSB3".into();
        assert!(build_opener(&cfg)?.describe().contains("/dev/ttyUSB3"));
        Ok(())
    }
}
