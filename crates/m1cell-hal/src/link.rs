//! Device-side transport.
//!
//! A [`DeviceLink`] is one open connection to a physical device speaking
//! 16-bit register reads and writes.  Bridges never hold a serial port
//! directly: they ask a [`LinkOpener`] for a fresh link after every device
//! loss, so the port is released (dropped) and reopened on each reconnect.

use std::time::Duration;

use async_trait::async_trait;
use m1cell_types::CellError;
use m1cell_types::config::{SerialConfig, SerialParity};
use tokio::time::{Instant, timeout};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::debug;

// ────────────────────────────────────────────────────────────────────────────
// Traits
// ────────────────────────────────────────────────────────────────────────────

/// Register-level access to one device.
///
/// Implementations must bound every call by a timeout; a link that returns
/// [`CellError::DeviceTimeout`] or [`CellError::DeviceProtocol`] stays open
/// but the caller may decide to drop it.
#[async_trait]
pub trait DeviceLink: Send {
    async fn read_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, CellError>;

    async fn write_register(&mut self, addr: u16, value: u16) -> Result<(), CellError>;

    async fn write_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), CellError>;
}

/// Factory for [`DeviceLink`]s.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open a new link.  Fails with [`CellError::DeviceUnreachable`] when the
    /// port cannot be opened.
    async fn open(&self) -> Result<Box<dyn DeviceLink>, CellError>;

    fn describe(&self) -> String;
}

// ────────────────────────────────────────────────────────────────────────────
// Modbus RTU over a serial port
// ────────────────────────────────────────────────────────────────────────────

/// Serial line parameters plus the device's slave id.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub parity: SerialParity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub timeout: Duration,
    /// Minimum gap between two consecutive transactions.
    pub inter_frame_delay: Duration,
    pub slave_id: u8,
}

impl SerialSettings {
    pub fn from_config(serial: &SerialConfig, slave_id: u8, serial_delay_ms: u64) -> Self {
        Self {
            port: serial.port.clone(),
            baud_rate: serial.baud_rate,
            parity: serial.parity,
            data_bits: serial.data_bits,
            stop_bits: serial.stop_bits,
            timeout: Duration::from_millis(serial.timeout_ms),
            inter_frame_delay: Duration::from_millis(serial_delay_ms),
            slave_id,
        }
    }

    fn builder(&self) -> tokio_serial::SerialPortBuilder {
        let parity = match self.parity {
            SerialParity::None => Parity::None,
            SerialParity::Even => Parity::Even,
            SerialParity::Odd => Parity::Odd,
        };
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        tokio_serial::new(&self.port, self.baud_rate)
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .timeout(self.timeout)
    }
}

/// Opens [`RtuLink`]s on a serial port.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    settings: SerialSettings,
}

impl SerialOpener {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LinkOpener for SerialOpener {
    async fn open(&self) -> Result<Box<dyn DeviceLink>, CellError> {
        let s = &self.settings;
        let stream = SerialStream::open(&s.builder()).map_err(|e| {
            CellError::DeviceUnreachable(format!("open {} at {} baud: {e}", s.port, s.baud_rate))
        })?;
        debug!(port = %s.port, baud = s.baud_rate, slave_id = s.slave_id, "serial port opened");
        Ok(Box::new(RtuLink {
            ctx: rtu::attach_slave(stream, Slave(s.slave_id)),
            port: s.port.clone(),
            timeout: s.timeout,
            inter_frame_delay: s.inter_frame_delay,
            last_io: None,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "modbus-rtu://{}?baud={}&slave={}",
            self.settings.port, self.settings.baud_rate, self.settings.slave_id
        )
    }
}

/// A Modbus RTU session on an exclusively owned serial port.
///
/// Dropping the link closes the port.
pub struct RtuLink {
    ctx: Context,
    port: String,
    timeout: Duration,
    inter_frame_delay: Duration,
    last_io: Option<Instant>,
}

impl RtuLink {
    async fn pace(&mut self) {
        if let Some(last) = self.last_io {
            let ready_at = last + self.inter_frame_delay;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }

    fn finish<T>(
        &mut self,
        op: &str,
        res: Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>,
    ) -> Result<T, CellError> {
        self.last_io = Some(Instant::now());
        match res {
            Err(_) => Err(CellError::DeviceTimeout(format!("{op} on {}", self.port))),
            Ok(Err(e)) => Err(CellError::DeviceProtocol(format!("{op} on {}: {e}", self.port))),
            Ok(Ok(Err(code))) => Err(CellError::DeviceException(u8::from(code))),
            Ok(Ok(Ok(v))) => Ok(v),
        }
    }
}

#[async_trait]
impl DeviceLink for RtuLink {
    async fn read_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, CellError> {
        self.pace().await;
        let res = timeout(self.timeout, self.ctx.read_holding_registers(addr, count)).await;
        self.finish("read", res)
    }

    async fn write_register(&mut self, addr: u16, value: u16) -> Result<(), CellError> {
        self.pace().await;
        let res = timeout(self.timeout, self.ctx.write_single_register(addr, value)).await;
        self.finish("write", res)
    }

    async fn write_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), CellError> {
        self.pace().await;
        let res = timeout(self.timeout, self.ctx.write_multiple_registers(addr, values)).await;
        self.finish("write", res)
    }
}
