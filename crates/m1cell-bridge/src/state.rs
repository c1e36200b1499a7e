//! Bridge state machine and counters.
//!
//! ```text
//! Init ──bus up──▶ BusReady ──device up──▶ Ready ◀──▶ Executing
//!                                           │  ▲
//!                      device lost ─────────┘  │ device back
//!                                           ▼  │
//!                                        DeviceDown
//!
//! device fault ──▶ Error ──reset_error ok──▶ Ready
//! ```

use m1cell_types::{CellError, ErrorCode, ModuleState};

/// Coarse lifecycle phase of a Device Bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    /// No bus connection yet.
    Init,
    /// Bus connected; device never opened.
    BusReady,
    Ready,
    Executing,
    /// Device lost; status publishing continues with `device_online = 0`.
    DeviceDown,
    /// Device-reported fault; only stop, emergency stop and reset accepted.
    Error,
}

impl BridgePhase {
    /// The `module_state` register value for this phase.
    pub fn module_state(self, in_motion: bool) -> ModuleState {
        match self {
            BridgePhase::Init | BridgePhase::BusReady | BridgePhase::DeviceDown => {
                ModuleState::Offline
            }
            BridgePhase::Executing => ModuleState::Busy,
            BridgePhase::Ready if in_motion => ModuleState::Busy,
            BridgePhase::Ready => ModuleState::Idle,
            BridgePhase::Error => ModuleState::Error,
        }
    }
}

/// Command outcome counters published in the status window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    /// Failed commands; saturates at `u16::MAX`.
    pub error_count: u16,
    /// Completed device commands; wraps at `u32::MAX`.
    pub op_count: u32,
    pub last_error_code: ErrorCode,
    pub last_command_id: u16,
}

impl Counters {
    pub fn record_success(&mut self, cid: u16, counts_as_op: bool) {
        if counts_as_op {
            self.op_count = self.op_count.wrapping_add(1);
        }
        self.last_error_code = ErrorCode::Ok;
        self.last_command_id = cid;
    }

    pub fn record_failure(&mut self, cid: u16, err: &CellError) {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error_code = err.code();
        self.last_command_id = cid;
    }
}
