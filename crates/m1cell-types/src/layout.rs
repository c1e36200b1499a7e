//! Register window geometry and typed views over raw register slices.
//!
//! Every Device Bridge owns a 20-register status window and a 5–10 register
//! command window.  Raw `u16` slices are only touched at the bus boundary;
//! everything else goes through [`StatusWindow`] and [`CommandRecord`].
//!
//! | Status offset | Field |
//! |---|---|
//! | 0 | `module_state` |
//! | 1 | `device_online` |
//! | 2, 4..=13 | device-specific fields |
//! | 3 | `error_count` |
//! | 14 | `executing` |
//! | 15 | `last_error_code` |
//! | 16, 17 | `op_count` lo/hi |
//! | 18 | `last_command_id` |
//! | 19 | `timestamp_lo` |

use serde::Serialize;

use crate::{DeviceKind, ModuleState};

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Length of every status window.
pub const STATUS_LEN: u16 = 20;
/// Canonical distance from `status_base` to `command_base`.
pub const COMMAND_OFFSET: u16 = 20;
/// Default command window length (opcode, param1, param2, command_id, spare).
pub const DEFAULT_COMMAND_LEN: u16 = 5;
pub const MIN_COMMAND_LEN: u16 = 5;
pub const MAX_COMMAND_LEN: u16 = 10;
/// Number of command registers the bridge must read to see a full tuple.
pub const COMMAND_HEADER_LEN: usize = 4;
/// Default size of the register bus address space.
pub const DEFAULT_REGISTER_COUNT: u16 = 2000;

/// Fixed status offsets shared by all device families.
pub mod offset {
    pub const MODULE_STATE: usize = 0;
    pub const DEVICE_ONLINE: usize = 1;
    pub const ERROR_COUNT: usize = 3;
    pub const EXECUTING: usize = 14;
    pub const LAST_ERROR_CODE: usize = 15;
    pub const OP_COUNT_LO: usize = 16;
    pub const OP_COUNT_HI: usize = 17;
    pub const LAST_COMMAND_ID: usize = 18;
    pub const TIMESTAMP_LO: usize = 19;
}

/// Shared opcode numbering.  Each family documents which of these it accepts.
pub mod opcode {
    pub const NOP: u16 = 0;
    pub const INIT: u16 = 1;
    pub const STOP: u16 = 2;
    pub const MOVE_ABSOLUTE: u16 = 3;
    pub const MOVE_RELATIVE: u16 = 4;
    pub const SET_PARAM: u16 = 5;
    pub const EMERGENCY_STOP: u16 = 6;
    pub const RESET_ERROR: u16 = 7;
    pub const HOME: u16 = 8;
}

/// `true` when `off` is free for device-specific use.
pub fn is_device_offset(off: usize) -> bool {
    off == 2 || (4..=13).contains(&off)
}

// ────────────────────────────────────────────────────────────────────────────
// 32-bit helpers (low word first)
// ────────────────────────────────────────────────────────────────────────────

pub fn split_u32(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

pub fn join_u32(lo: u16, hi: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

pub fn split_i32(value: i32) -> [u16; 2] {
    split_u32(value as u32)
}

pub fn join_i32(lo: u16, hi: u16) -> i32 {
    join_u32(lo, hi) as i32
}

// ────────────────────────────────────────────────────────────────────────────
// RegisterWindow
// ────────────────────────────────────────────────────────────────────────────

/// A half-open `[base, base + len)` range of bus registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RegisterWindow {
    pub base: u16,
    pub len: u16,
}

impl RegisterWindow {
    pub fn new(base: u16, len: u16) -> Self {
        Self { base, len }
    }

    /// Exclusive end address, widened so `base + len` cannot wrap.
    pub fn end(&self) -> u32 {
        u32::from(self.base) + u32::from(self.len)
    }

    pub fn overlaps(&self, other: &RegisterWindow) -> bool {
        u32::from(self.base) < other.end() && u32::from(other.base) < self.end()
    }

    /// `true` when the whole window lies inside an address space of `count`.
    pub fn fits_within(&self, count: u16) -> bool {
        self.end() <= u32::from(count)
    }
}

impl std::fmt::Display for RegisterWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.base, self.end())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StatusWindow
// ────────────────────────────────────────────────────────────────────────────

/// Typed view over the 20 registers of a status window.
///
/// Accessors do the offset arithmetic and 32-bit composition; the raw array
/// is exposed only through [`StatusWindow::registers`] for the bus write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusWindow {
    regs: [u16; STATUS_LEN as usize],
}

impl StatusWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a view from a bus read.  Returns `None` unless exactly
    /// [`STATUS_LEN`] registers are supplied.
    pub fn from_registers(raw: &[u16]) -> Option<Self> {
        let regs: [u16; STATUS_LEN as usize] = raw.try_into().ok()?;
        Some(Self { regs })
    }

    pub fn registers(&self) -> &[u16] {
        &self.regs
    }

    pub fn module_state(&self) -> Option<ModuleState> {
        ModuleState::from_u16(self.regs[offset::MODULE_STATE])
    }

    pub fn set_module_state(&mut self, state: ModuleState) {
        self.regs[offset::MODULE_STATE] = state.as_u16();
    }

    pub fn device_online(&self) -> bool {
        self.regs[offset::DEVICE_ONLINE] != 0
    }

    pub fn set_device_online(&mut self, online: bool) {
        self.regs[offset::DEVICE_ONLINE] = u16::from(online);
    }

    pub fn error_count(&self) -> u16 {
        self.regs[offset::ERROR_COUNT]
    }

    pub fn set_error_count(&mut self, count: u16) {
        self.regs[offset::ERROR_COUNT] = count;
    }

    pub fn executing(&self) -> bool {
        self.regs[offset::EXECUTING] != 0
    }

    pub fn set_executing(&mut self, executing: bool) {
        self.regs[offset::EXECUTING] = u16::from(executing);
    }

    pub fn last_error_code(&self) -> u16 {
        self.regs[offset::LAST_ERROR_CODE]
    }

    pub fn set_last_error_code(&mut self, code: u16) {
        self.regs[offset::LAST_ERROR_CODE] = code;
    }

    pub fn op_count(&self) -> u32 {
        join_u32(self.regs[offset::OP_COUNT_LO], self.regs[offset::OP_COUNT_HI])
    }

    pub fn set_op_count(&mut self, count: u32) {
        let [lo, hi] = split_u32(count);
        self.regs[offset::OP_COUNT_LO] = lo;
        self.regs[offset::OP_COUNT_HI] = hi;
    }

    pub fn last_command_id(&self) -> u16 {
        self.regs[offset::LAST_COMMAND_ID]
    }

    pub fn set_last_command_id(&mut self, cid: u16) {
        self.regs[offset::LAST_COMMAND_ID] = cid;
    }

    pub fn timestamp_lo(&self) -> u16 {
        self.regs[offset::TIMESTAMP_LO]
    }

    pub fn set_timestamp_lo(&mut self, ts: u16) {
        self.regs[offset::TIMESTAMP_LO] = ts;
    }

    /// Read a device-specific register.  Offsets outside the device area
    /// read as 0.
    pub fn device(&self, off: usize) -> u16 {
        if is_device_offset(off) {
            self.regs[off]
        } else {
            0
        }
    }

    /// Write a device-specific register.  Writes to common offsets are
    /// ignored so device encoders cannot clobber bridge-owned fields.
    pub fn set_device(&mut self, off: usize, value: u16) {
        if is_device_offset(off) {
            self.regs[off] = value;
        }
    }

    pub fn set_device_bool(&mut self, off: usize, value: bool) {
        self.set_device(off, u16::from(value));
    }

    pub fn device_i32(&self, lo_off: usize) -> i32 {
        join_i32(self.device(lo_off), self.device(lo_off + 1))
    }

    pub fn set_device_i32(&mut self, lo_off: usize, value: i32) {
        let [lo, hi] = split_i32(value);
        self.set_device(lo_off, lo);
        self.set_device(lo_off + 1, hi);
    }

    /// Decode every device-specific field of `kind` by name.
    pub fn device_fields(&self, kind: DeviceKind) -> Vec<(&'static str, FieldValue)> {
        field_table(kind)
            .iter()
            .map(|spec| (spec.name, spec.decode(self)))
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-family field tables
// ────────────────────────────────────────────────────────────────────────────

/// Encoding of one device-specific status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U16,
    Bool,
    I16,
    /// Occupies `offset` (low word) and `offset + 1`.
    I32,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
}

impl FieldSpec {
    const fn new(name: &'static str, offset: usize, kind: FieldKind) -> Self {
        Self { name, offset, kind }
    }

    fn decode(&self, window: &StatusWindow) -> FieldValue {
        let raw = window.device(self.offset);
        match self.kind {
            FieldKind::U16 => FieldValue::U16(raw),
            FieldKind::Bool => FieldValue::Bool(raw != 0),
            FieldKind::I16 => FieldValue::I16(raw as i16),
            FieldKind::I32 => FieldValue::I32(window.device_i32(self.offset)),
        }
    }
}

/// A decoded device field, serialised as a bare JSON scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    U16(u16),
    Bool(bool),
    I16(i16),
    I32(i32),
}

/// LED controller status fields.
pub mod led {
    pub const ACTIVE_CHANNELS: usize = 2;
    /// Channel `n` (1-based) state lives at `CHANNEL_STATE + n - 1`.
    pub const CHANNEL_STATE: usize = 4;
    pub const CHANNEL_BRIGHTNESS: usize = 8;
    pub const TEMPERATURE: usize = 12;
    pub const DEVICE_FAULT: usize = 13;
    pub const CHANNELS: u16 = 4;
}

/// PGC gripper status fields.
pub mod gripper {
    pub const INIT_STATE: usize = 2;
    pub const GRIP_STATE: usize = 4;
    pub const POSITION: usize = 5;
    pub const TARGET: usize = 6;
    pub const FORCE: usize = 7;
    pub const SPEED: usize = 8;
    pub const MOTION_COMPLETE: usize = 9;
    pub const DEVICE_FAULT: usize = 10;
}

/// Motion axis (linear stage, rotary platform, angle motor) status fields.
pub mod axis {
    pub const ENABLED: usize = 2;
    pub const POSITION: usize = 4;
    pub const TARGET: usize = 6;
    pub const IN_MOTION: usize = 8;
    pub const MOTION_COMPLETE: usize = 9;
    pub const HOMED: usize = 10;
    pub const SPEED: usize = 11;
    pub const ALARM_CODE: usize = 12;
}

/// Vibration plate status fields.
pub mod vibration {
    pub const RUNNING: usize = 2;
    pub const FREQUENCY: usize = 4;
    pub const AMPLITUDE: usize = 5;
    pub const BACKLIGHT_ON: usize = 6;
    pub const BACKLIGHT_BRIGHTNESS: usize = 7;
    pub const DEVICE_FAULT: usize = 8;
}

const LED_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("active_channels", led::ACTIVE_CHANNELS, FieldKind::U16),
    FieldSpec::new("l1_state", led::CHANNEL_STATE, FieldKind::Bool),
    FieldSpec::new("l2_state", led::CHANNEL_STATE + 1, FieldKind::Bool),
    FieldSpec::new("l3_state", led::CHANNEL_STATE + 2, FieldKind::Bool),
    FieldSpec::new("l4_state", led::CHANNEL_STATE + 3, FieldKind::Bool),
    FieldSpec::new("l1_brightness", led::CHANNEL_BRIGHTNESS, FieldKind::U16),
    FieldSpec::new("l2_brightness", led::CHANNEL_BRIGHTNESS + 1, FieldKind::U16),
    FieldSpec::new("l3_brightness", led::CHANNEL_BRIGHTNESS + 2, FieldKind::U16),
    FieldSpec::new("l4_brightness", led::CHANNEL_BRIGHTNESS + 3, FieldKind::U16),
    FieldSpec::new("temperature_decidegc", led::TEMPERATURE, FieldKind::I16),
    FieldSpec::new("device_fault", led::DEVICE_FAULT, FieldKind::U16),
];

const GRIPPER_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("init_state", gripper::INIT_STATE, FieldKind::U16),
    FieldSpec::new("grip_state", gripper::GRIP_STATE, FieldKind::U16),
    FieldSpec::new("position", gripper::POSITION, FieldKind::U16),
    FieldSpec::new("target", gripper::TARGET, FieldKind::U16),
    FieldSpec::new("force", gripper::FORCE, FieldKind::U16),
    FieldSpec::new("speed", gripper::SPEED, FieldKind::U16),
    FieldSpec::new("motion_complete", gripper::MOTION_COMPLETE, FieldKind::Bool),
    FieldSpec::new("device_fault", gripper::DEVICE_FAULT, FieldKind::U16),
];

const AXIS_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("enabled", axis::ENABLED, FieldKind::Bool),
    FieldSpec::new("position", axis::POSITION, FieldKind::I32),
    FieldSpec::new("target", axis::TARGET, FieldKind::I32),
    FieldSpec::new("in_motion", axis::IN_MOTION, FieldKind::Bool),
    FieldSpec::new("motion_complete", axis::MOTION_COMPLETE, FieldKind::Bool),
    FieldSpec::new("homed", axis::HOMED, FieldKind::Bool),
    FieldSpec::new("speed", axis::SPEED, FieldKind::U16),
    FieldSpec::new("alarm_code", axis::ALARM_CODE, FieldKind::U16),
];

const VIBRATION_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("running", vibration::RUNNING, FieldKind::Bool),
    FieldSpec::new("frequency", vibration::FREQUENCY, FieldKind::U16),
    FieldSpec::new("amplitude", vibration::AMPLITUDE, FieldKind::U16),
    FieldSpec::new("backlight_on", vibration::BACKLIGHT_ON, FieldKind::Bool),
    FieldSpec::new(
        "backlight_brightness",
        vibration::BACKLIGHT_BRIGHTNESS,
        FieldKind::U16,
    ),
    FieldSpec::new("device_fault", vibration::DEVICE_FAULT, FieldKind::U16),
];

/// Device-specific status fields of `kind`.
pub fn field_table(kind: DeviceKind) -> &'static [FieldSpec] {
    match kind {
        DeviceKind::LedController => LED_FIELDS,
        DeviceKind::PgcGripper => GRIPPER_FIELDS,
        DeviceKind::LinearStage | DeviceKind::RotaryPlatform | DeviceKind::AngleMotor => {
            AXIS_FIELDS
        }
        DeviceKind::VibrationPlate => VIBRATION_FIELDS,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CommandRecord
// ────────────────────────────────────────────────────────────────────────────

/// The `(opcode, param1, param2, command_id, …)` tuple of a command window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CommandRecord {
    pub opcode: u16,
    pub param1: u16,
    pub param2: u16,
    /// `0` means "no pending command".
    pub command_id: u16,
    /// Opcode-specific registers at offset 4 and beyond.
    pub extra: Vec<u16>,
}

impl CommandRecord {
    pub fn new(opcode: u16, param1: u16, param2: u16, command_id: u16) -> Self {
        Self {
            opcode,
            param1,
            param2,
            command_id,
            extra: Vec::new(),
        }
    }

    /// Parse a command window read.  Needs at least the four header registers.
    pub fn from_registers(raw: &[u16]) -> Option<Self> {
        if raw.len() < COMMAND_HEADER_LEN {
            return None;
        }
        Some(Self {
            opcode: raw[0],
            param1: raw[1],
            param2: raw[2],
            command_id: raw[3],
            extra: raw[COMMAND_HEADER_LEN..].to_vec(),
        })
    }

    /// Serialise into exactly `len` registers, zero-padding or truncating
    /// the opcode-specific tail.
    pub fn to_registers(&self, len: usize) -> Vec<u16> {
        let mut regs = vec![self.opcode, self.param1, self.param2, self.command_id];
        regs.extend(self.extra.iter().copied());
        regs.resize(len.max(COMMAND_HEADER_LEN), 0);
        regs
    }

    pub fn is_pending(&self) -> bool {
        self.command_id != 0
    }

    /// `param1`/`param2` read as one signed 32-bit value, low word first.
    pub fn param_i32(&self) -> i32 {
        join_i32(self.param1, self.param2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_split_is_low_word_first() {
        assert_eq!(split_u32(0x0001_0002), [0x0002, 0x0001]);
        assert_eq!(join_u32(0x0002, 0x0001), 0x0001_0002);
    }

    #[test]
    fn i32_uses_twos_complement() {
        let regs = split_i32(-5);
        assert_eq!(regs, [0xFFFB, 0xFFFF]);
        assert_eq!(join_i32(regs[0], regs[1]), -5);
    }

    #[test]
    fn windows_overlap_only_when_ranges_intersect() {
        let led = RegisterWindow::new(500, 20);
        let pgc_same = RegisterWindow::new(500, 20);
        let pgc_next = RegisterWindow::new(540, 20);
        let touching = RegisterWindow::new(520, 5);
        assert!(led.overlaps(&pgc_same));
        assert!(!led.overlaps(&pgc_next));
        assert!(!led.overlaps(&touching));
        assert!(touching.overlaps(&RegisterWindow::new(524, 1)));
    }

    #[test]
    fn window_end_does_not_wrap() {
        let w = RegisterWindow::new(u16::MAX, 20);
        assert_eq!(w.end(), 65_555);
        assert!(!w.fits_within(2000));
    }

    #[test]
    fn status_window_accessors_hit_fixed_offsets() {
        let mut s = StatusWindow::new();
        s.set_module_state(ModuleState::Busy);
        s.set_device_online(true);
        s.set_error_count(7);
        s.set_op_count(0x0002_0003);
        s.set_timestamp_lo(1234);
        s.set_executing(true);
        let raw = s.registers();
        assert_eq!(raw[0], 2);
        assert_eq!(raw[1], 1);
        assert_eq!(raw[3], 7);
        assert_eq!(raw[14], 1);
        assert_eq!(raw[16], 3);
        assert_eq!(raw[17], 2);
        assert_eq!(raw[19], 1234);
        assert_eq!(s.op_count(), 0x0002_0003);
    }

    #[test]
    fn device_setters_cannot_touch_common_fields() {
        let mut s = StatusWindow::new();
        s.set_error_count(5);
        s.set_device(offset::ERROR_COUNT, 99);
        s.set_device(offset::TIMESTAMP_LO, 99);
        assert_eq!(s.error_count(), 5);
        assert_eq!(s.timestamp_lo(), 0);
        s.set_device(led::ACTIVE_CHANNELS, 3);
        assert_eq!(s.device(led::ACTIVE_CHANNELS), 3);
    }

    #[test]
    fn device_i32_roundtrip_in_status() {
        let mut s = StatusWindow::new();
        s.set_device_i32(axis::POSITION, -120_000);
        assert_eq!(s.device_i32(axis::POSITION), -120_000);
    }

    #[test]
    fn from_registers_requires_exact_length() {
        assert!(StatusWindow::from_registers(&[0; 19]).is_none());
        assert!(StatusWindow::from_registers(&[0; 20]).is_some());
    }

    #[test]
    fn led_field_table_matches_documented_offsets() {
        let mut s = StatusWindow::new();
        s.set_device(led::CHANNEL_BRIGHTNESS + 1, 300);
        s.set_device(led::CHANNEL_STATE + 1, 1);
        let fields = s.device_fields(DeviceKind::LedController);
        let get = |name: &str| fields.iter().find(|(n, _)| *n == name).map(|(_, v)| *v);
        assert_eq!(get("l2_brightness"), Some(FieldValue::U16(300)));
        assert_eq!(get("l2_state"), Some(FieldValue::Bool(true)));
        // L2 brightness is register 509 when the window starts at 500.
        assert_eq!(500 + led::CHANNEL_BRIGHTNESS + 1, 509);
    }

    #[test]
    fn every_field_table_uses_device_offsets_only() {
        for kind in [
            DeviceKind::LedController,
            DeviceKind::PgcGripper,
            DeviceKind::LinearStage,
            DeviceKind::VibrationPlate,
        ] {
            for spec in field_table(kind) {
                assert!(is_device_offset(spec.offset), "{} in {kind}", spec.name);
                if spec.kind == FieldKind::I32 {
                    assert!(is_device_offset(spec.offset + 1));
                }
            }
        }
    }

    #[test]
    fn command_record_parses_header_and_tail() {
        let rec = CommandRecord::from_registers(&[4, 2, 300, 1234, 9]).unwrap();
        assert_eq!(rec.opcode, 4);
        assert_eq!(rec.param1, 2);
        assert_eq!(rec.param2, 300);
        assert_eq!(rec.command_id, 1234);
        assert_eq!(rec.extra, vec![9]);
        assert!(CommandRecord::from_registers(&[1, 2, 3]).is_none());
    }

    #[test]
    fn command_record_pads_to_window_length() {
        let rec = CommandRecord::new(3, 400, 0, 7001);
        assert_eq!(rec.to_registers(5), vec![3, 400, 0, 7001, 0]);
        assert_eq!(rec.to_registers(7).len(), 7);
    }

    #[test]
    fn command_param_i32_combines_params() {
        let [lo, hi] = split_i32(-70_000);
        let rec = CommandRecord::new(3, lo, hi, 1);
        assert_eq!(rec.param_i32(), -70_000);
    }
}
