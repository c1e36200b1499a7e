//! Register access seam.
//!
//! Bridges and web surfaces never speak Modbus directly; they hold a
//! `Box<dyn RegisterIo>` obtained from a [`BusConnector`].
//!
//! | Type | Backing |
//! |---|---|
//! | [`BusClient`] / [`TcpConnector`] | Modbus TCP connection to a [`BusServer`](crate::BusServer) |
//! | [`LocalBus`] / [`LocalConnector`] | direct access to an in-process [`RegisterBank`] |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use m1cell_types::CellError;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::bank::RegisterBank;

// ────────────────────────────────────────────────────────────────────────────
// RegisterIo
// ────────────────────────────────────────────────────────────────────────────

/// Holding-register access as seen by a bus client.
///
/// A [`CellError::BusUnreachable`] from any method means the connection is
/// unusable and must be replaced through the [`BusConnector`]; a
/// [`CellError::BusException`] leaves it usable.
#[async_trait]
pub trait RegisterIo: Send {
    async fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, CellError>;

    /// Write `values` in a single multi-register request.
    async fn write(&mut self, addr: u16, values: &[u16]) -> Result<(), CellError>;

    async fn write_single(&mut self, addr: u16, value: u16) -> Result<(), CellError>;
}

/// Factory for fresh [`RegisterIo`] connections.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RegisterIo>, CellError>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

// ────────────────────────────────────────────────────────────────────────────
// Modbus TCP client
// ────────────────────────────────────────────────────────────────────────────

/// A Modbus TCP connection with a per-request timeout.
pub struct BusClient {
    ctx: Context,
    peer: SocketAddr,
    timeout: Duration,
}

impl BusClient {
    /// Connect to `peer`, giving up after `request_timeout`.
    pub async fn connect(
        peer: SocketAddr,
        slave_id: u8,
        request_timeout: Duration,
    ) -> Result<Self, CellError> {
        let ctx = timeout(request_timeout, tcp::connect_slave(peer, Slave(slave_id)))
            .await
            .map_err(|_| CellError::BusUnreachable(format!("connect to {peer} timed out")))?
            .map_err(|e| CellError::BusUnreachable(format!("connect to {peer}: {e}")))?;
        debug!(%peer, slave_id, "bus client connected");
        Ok(Self {
            ctx,
            peer,
            timeout: request_timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn unreachable(&self, what: &str, detail: impl std::fmt::Display) -> CellError {
        CellError::BusUnreachable(format!("{what} on {}: {detail}", self.peer))
    }
}

#[async_trait]
impl RegisterIo for BusClient {
    async fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, CellError> {
        let res = timeout(self.timeout, self.ctx.read_holding_registers(addr, count))
            .await
            .map_err(|_| self.unreachable("read", "timed out"))?;
        res.map_err(|e| self.unreachable("read", e))?
            .map_err(|code| CellError::BusException(u8::from(code)))
    }

    async fn write(&mut self, addr: u16, values: &[u16]) -> Result<(), CellError> {
        let res = timeout(self.timeout, self.ctx.write_multiple_registers(addr, values))
            .await
            .map_err(|_| self.unreachable("write", "timed out"))?;
        res.map_err(|e| self.unreachable("write", e))?
            .map_err(|code| CellError::BusException(u8::from(code)))
    }

    async fn write_single(&mut self, addr: u16, value: u16) -> Result<(), CellError> {
        let res = timeout(self.timeout, self.ctx.write_single_register(addr, value))
            .await
            .map_err(|_| self.unreachable("write", "timed out"))?;
        res.map_err(|e| self.unreachable("write", e))?
            .map_err(|code| CellError::BusException(u8::from(code)))
    }
}

/// Connects [`BusClient`]s to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    target: String,
    slave_id: u8,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16, slave_id: u8, timeout: Duration) -> Self {
        Self {
            target: format!("{host}:{port}"),
            slave_id,
            timeout,
        }
    }

    pub fn from_addr(addr: SocketAddr, slave_id: u8, timeout: Duration) -> Self {
        Self {
            target: addr.to_string(),
            slave_id,
            timeout,
        }
    }
}

#[async_trait]
impl BusConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn RegisterIo>, CellError> {
        let peer = tokio::net::lookup_host(&self.target)
            .await
            .map_err(|e| CellError::BusUnreachable(format!("resolve {}: {e}", self.target)))?
            .next()
            .ok_or_else(|| CellError::BusUnreachable(format!("{} has no address", self.target)))?;
        let client = BusClient::connect(peer, self.slave_id, self.timeout).await?;
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        format!("modbus-tcp://{}", self.target)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-process client
// ────────────────────────────────────────────────────────────────────────────

/// Direct access to a [`RegisterBank`] living in the same process.
#[derive(Debug, Clone)]
pub struct LocalBus {
    bank: Arc<RegisterBank>,
}

impl LocalBus {
    pub fn new(bank: Arc<RegisterBank>) -> Self {
        Self { bank }
    }
}

#[async_trait]
impl RegisterIo for LocalBus {
    async fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, CellError> {
        self.bank
            .read(addr, count)
            .map_err(|code| CellError::BusException(u8::from(code)))
    }

    async fn write(&mut self, addr: u16, values: &[u16]) -> Result<(), CellError> {
        self.bank
            .write(addr, values)
            .map_err(|code| CellError::BusException(u8::from(code)))
    }

    async fn write_single(&mut self, addr: u16, value: u16) -> Result<(), CellError> {
        self.write(addr, std::slice::from_ref(&value)).await
    }
}

/// Hands out [`LocalBus`] clients for one bank.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    bank: Arc<RegisterBank>,
}

impl LocalConnector {
    pub fn new(bank: Arc<RegisterBank>) -> Self {
        Self { bank }
    }
}

#[async_trait]
impl BusConnector for LocalConnector {
    async fn connect(&self) -> Result<Box<dyn RegisterIo>, CellError> {
        Ok(Box::new(LocalBus::new(Arc::clone(&self.bank))))
    }

    fn describe(&self) -> String {
        "in-process".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::BusServer;

    #[tokio::test]
    async fn tcp_connector_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let bus = BusServer::new(Arc::new(RegisterBank::new(1000)))
            .spawn("127.0.0.1:0".parse()?)
            .await?;
        let connector = TcpConnector::from_addr(bus.local_addr(), 1, Duration::from_secs(1));
        let mut io = connector.connect().await?;
        io.write(540, &[3, 400, 0, 7001, 0]).await?;
        io.write_single(544, 9).await?;
        assert_eq!(io.read(540, 5).await?, vec![3, 400, 0, 7001, 9]);
        bus.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn tcp_exception_is_bus_exception() -> Result<(), Box<dyn std::error::Error>> {
        let bus = BusServer::new(Arc::new(RegisterBank::new(1000)))
            .spawn("127.0.0.1:0".parse()?)
            .await?;
        let mut io = TcpConnector::from_addr(bus.local_addr(), 1, Duration::from_secs(1))
            .connect()
            .await?;
        let err = io.read(999, 5).await.unwrap_err();
        assert!(matches!(err, CellError::BusException(0x02)), "{err:?}");
        bus.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = TcpConnector::from_addr(addr, 1, Duration::from_millis(500))
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CellError::BusUnreachable(_)));
    }

    #[tokio::test]
    async fn local_bus_shares_the_bank() -> Result<(), Box<dyn std::error::Error>> {
        let bank = Arc::new(RegisterBank::new(1000));
        let connector = LocalConnector::new(Arc::clone(&bank));
        let mut a = connector.connect().await?;
        let mut b = connector.connect().await?;
        a.write(500, &[1, 2, 3]).await?;
        assert_eq!(b.read(500, 3).await?, vec![1, 2, 3]);
        assert_eq!(bank.read(501, 1).unwrap(), vec![2]);
        Ok(())
    }
}
