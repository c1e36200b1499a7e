//! [`RegisterBank`] – the bus's cell array.
//!
//! One mutex guards the whole array, so each read or write call is applied
//! atomically: a concurrent reader sees either the full pre-image or the full
//! post-image of any single write call.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_modbus::ExceptionCode;
use tracing::debug;

/// Minimum address space every bus offers.
pub const MIN_REGISTERS: u16 = 1000;

/// Flat array of holding registers addressed `[0, N)`.
#[derive(Debug)]
pub struct RegisterBank {
    registers: Mutex<Vec<u16>>,
}

impl RegisterBank {
    /// Create a zeroed bank.  `count` is raised to [`MIN_REGISTERS`] when
    /// smaller.
    pub fn new(count: u16) -> Self {
        Self {
            registers: Mutex::new(vec![0; usize::from(count.max(MIN_REGISTERS))]),
        }
    }

    /// Number of addressable registers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `count` registers starting at `addr`.
    pub fn read(&self, addr: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        let regs = self.lock();
        let range = checked_range(regs.len(), addr, usize::from(count))?;
        Ok(regs[range].to_vec())
    }

    /// Write `values` starting at `addr` in one critical section.
    pub fn write(&self, addr: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let mut regs = self.lock();
        let range = checked_range(regs.len(), addr, values.len())?;
        regs[range].copy_from_slice(values);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        // A panic while holding the lock cannot leave a half-written slice
        // because copy_from_slice does not unwind mid-copy.
        self.registers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn checked_range(
    len: usize,
    addr: u16,
    count: usize,
) -> Result<std::ops::Range<usize>, ExceptionCode> {
    let start = usize::from(addr);
    let end = start + count;
    if count == 0 || end > len {
        debug!(addr, count, len, "register access outside address space");
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn bank_has_at_least_min_registers() {
        assert_eq!(RegisterBank::new(10).len(), 1000);
        assert_eq!(RegisterBank::new(2000).len(), 2000);
    }

    #[test]
    fn write_then_read_returns_values() {
        let bank = RegisterBank::new(1000);
        bank.write(520, &[4, 2, 300, 1234, 0]).unwrap();
        assert_eq!(bank.read(520, 5).unwrap(), vec![4, 2, 300, 1234, 0]);
    }

    #[test]
    fn out_of_range_read_is_illegal_address() {
        let bank = RegisterBank::new(1000);
        assert_eq!(bank.read(999, 1).unwrap(), vec![0]);
        assert_eq!(bank.read(999, 2), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(bank.read(u16::MAX, 1), Err(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn out_of_range_write_leaves_bank_untouched() {
        let bank = RegisterBank::new(1000);
        assert_eq!(
            bank.write(998, &[1, 2, 3]),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(bank.read(998, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn concurrent_readers_never_see_torn_writes() {
        let bank = Arc::new(RegisterBank::new(1000));
        let writer = {
            let bank = Arc::clone(&bank);
            std::thread::spawn(move || {
                for i in 0..2000u16 {
                    bank.write(100, &[i; 20]).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            let view = bank.read(100, 20).unwrap();
            assert!(view.iter().all(|v| *v == view[0]), "torn view: {view:?}");
        }
        writer.join().unwrap();
    }
}
