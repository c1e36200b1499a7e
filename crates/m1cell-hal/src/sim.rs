//! In-process device simulation for tests and `device.simulate = true`.
//!
//! [`SimLink`] is a cloneable handle onto a shared register model.  Clones
//! see the same registers, so a test can keep one handle to inspect or
//! fault the "device" while the bridge owns another.
//!
//! # Behaviour
//!
//! | Situation | Result |
//! |---|---|
//! | unknown register | reads as `0` |
//! | write to a register with a hook | value stored, then hook runs |
//! | [`SimLink::set_online(false)`] | [`SimOpener::open`] fails with `DeviceUnreachable`; I/O on an open link fails with `DeviceTimeout` |
//! | [`SimLink::fail_next`] | the next `n` transactions fail with `DeviceProtocol` |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use m1cell_types::CellError;

use crate::link::{DeviceLink, LinkOpener};

/// Callback run after a write lands on its register.
pub type WriteHook = Arc<dyn Fn(&mut SimRegisters, u16) + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// Register model
// ────────────────────────────────────────────────────────────────────────────

/// Sparse register file of a simulated device.
#[derive(Debug, Default, Clone)]
pub struct SimRegisters {
    values: BTreeMap<u16, u16>,
}

impl SimRegisters {
    pub fn get(&self, addr: u16) -> u16 {
        self.values.get(&addr).copied().unwrap_or(0)
    }

    pub fn set(&mut self, addr: u16, value: u16) {
        self.values.insert(addr, value);
    }
}

#[derive(Default)]
struct SimState {
    registers: SimRegisters,
    hooks: BTreeMap<u16, WriteHook>,
    online: bool,
    pending_failures: u32,
    reads: u64,
    writes: u64,
    write_log: Vec<(u16, Vec<u16>)>,
}

// ────────────────────────────────────────────────────────────────────────────
// SimLink
// ────────────────────────────────────────────────────────────────────────────

/// Shared handle onto a simulated device.
#[derive(Clone)]
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLink {
    /// A fresh, online device with all registers at zero.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                online: true,
                ..SimState::default()
            })),
        }
    }

    /// Run `hook` after every write to `addr` (builder-style).
    pub fn on_write(
        self,
        addr: u16,
        hook: impl Fn(&mut SimRegisters, u16) + Send + Sync + 'static,
    ) -> Self {
        self.lock().hooks.insert(addr, Arc::new(hook));
        self
    }

    /// Preset a register without counting it as device traffic.
    pub fn preset(&self, addr: u16, value: u16) {
        self.lock().registers.set(addr, value);
    }

    pub fn register(&self, addr: u16) -> u16 {
        self.lock().registers.get(addr)
    }

    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Make the next `n` transactions fail with a protocol error.
    pub fn fail_next(&self, n: u32) {
        self.lock().pending_failures = n;
    }

    /// Number of read transactions served.
    pub fn reads(&self) -> u64 {
        self.lock().reads
    }

    /// Number of write transactions served.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Every write served so far as `(addr, values)`.
    pub fn write_log(&self) -> Vec<(u16, Vec<u16>)> {
        self.lock().write_log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(state: &mut SimState) -> Result<(), CellError> {
        if !state.online {
            return Err(CellError::DeviceTimeout("simulated device offline".into()));
        }
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(CellError::DeviceProtocol("simulated CRC mismatch".into()));
        }
        Ok(())
    }

    fn apply_write(&self, addr: u16, values: &[u16]) -> Result<(), CellError> {
        let mut state = self.lock();
        Self::gate(&mut state)?;
        state.writes += 1;
        state.write_log.push((addr, values.to_vec()));
        for (i, value) in values.iter().enumerate() {
            state.registers.set(addr.wrapping_add(i as u16), *value);
        }
        let hooks: Vec<(u16, WriteHook)> = (0..values.len())
            .filter_map(|i| {
                let reg = addr.wrapping_add(i as u16);
                state.hooks.get(&reg).map(|h| (reg, Arc::clone(h)))
            })
            .collect();
        for (reg, hook) in hooks {
            let value = state.registers.get(reg);
            hook(&mut state.registers, value);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceLink for SimLink {
    async fn read_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, CellError> {
        let mut state = self.lock();
        Self::gate(&mut state)?;
        state.reads += 1;
        Ok((0..count)
            .map(|i| state.registers.get(addr.wrapping_add(i)))
            .collect())
    }

    async fn write_register(&mut self, addr: u16, value: u16) -> Result<(), CellError> {
        self.apply_write(addr, std::slice::from_ref(&value))
    }

    async fn write_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), CellError> {
        self.apply_write(addr, values)
    }
}

/// Hands out clones of one [`SimLink`]; refuses while it is offline.
#[derive(Clone)]
pub struct SimOpener {
    link: SimLink,
}

impl SimOpener {
    pub fn new(link: SimLink) -> Self {
        Self { link }
    }

    pub fn link(&self) -> SimLink {
        self.link.clone()
    }
}

#[async_trait]
impl LinkOpener for SimOpener {
    async fn open(&self) -> Result<Box<dyn DeviceLink>, CellError> {
        if !self.link.is_online() {
            return Err(CellError::DeviceUnreachable("simulated device unplugged".into()));
        }
        Ok(Box::new(self.link.clone()))
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}
