//! [`BusServer`] – Modbus TCP front-end for a [`RegisterBank`].
//!
//! Serves read-holding (0x03), write-single (0x06) and write-multiple (0x10).
//! Any other function code is answered with `IllegalFunction`; malformed
//! frames only close the offending connection, never the listener.
//!
//! Each accepted socket is wrapped in a [`GuardedStream`] that
//!
//! * closes the connection once it has been idle for the configured
//!   timeout, so dead clients are released promptly, and
//! * reports end-of-stream as soon as [`BusServerHandle::shutdown`] is
//!   called, so a stopped bus really drops its clients.

use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use m1cell_types::CellError;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::Server;
use tracing::{debug, error, info, warn};

use crate::bank::RegisterBank;

/// The well-known Modbus TCP port.
pub const DEFAULT_PORT: u16 = 502;

/// Connections silent for longer than this are closed.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Per-connection Modbus service.  Every instance shares the same bank.
#[derive(Clone)]
struct BusService {
    bank: Arc<RegisterBank>,
}

impl tokio_modbus::server::Service for BusService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                self.bank.read(addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::WriteMultipleRegisters(addr, values) => self
                .bank
                .write(addr, &values)
                .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16)),
            Request::WriteSingleRegister(addr, value) => self
                .bank
                .write(addr, std::slice::from_ref(&value))
                .map(|_| Response::WriteSingleRegister(addr, value)),
            other => {
                debug!(request = ?other, "unsupported function code");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

// ---------------------------------------------------------------------------
// BusServer
// ---------------------------------------------------------------------------

/// Builder for a running register bus.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use m1cell_bus::{BusServer, RegisterBank};
///
/// # async fn demo() -> Result<(), m1cell_types::CellError> {
/// let bank = Arc::new(RegisterBank::new(2000));
/// let handle = BusServer::new(bank)
///     .spawn("127.0.0.1:502".parse().unwrap())
///     .await?;
/// println!("bus on {}", handle.local_addr());
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct BusServer {
    bank: Arc<RegisterBank>,
    idle_timeout: Duration,
}

impl BusServer {
    pub fn new(bank: Arc<RegisterBank>) -> Self {
        Self {
            bank,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Override the idle-close timeout (builder-style).
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Bind `addr` and serve in a background task.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::Io`] if the listener cannot bind.
    pub async fn spawn(self, addr: SocketAddr) -> Result<BusServerHandle, CellError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CellError::Io(format!("bus bind error on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, registers = self.bank.len(), "register bus listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bank = Arc::clone(&self.bank);
        let idle_timeout = self.idle_timeout;

        let task = tokio::spawn(async move {
            let server = Server::new(listener);
            let on_connected = move |stream: TcpStream, peer: SocketAddr| {
                let service = BusService {
                    bank: Arc::clone(&bank),
                };
                let shutdown = shutdown_rx.clone();
                async move {
                    debug!(%peer, "bus client connected");
                    let stream = GuardedStream::new(stream, idle_timeout, shutdown);
                    Ok::<_, io::Error>(Some((service, stream)))
                }
            };
            let on_process_error = |err: io::Error| {
                warn!(error = %err, "bus connection closed with error");
            };
            if let Err(e) = server.serve(&on_connected, on_process_error).await {
                error!(error = %e, "register bus stopped");
            }
        });

        Ok(BusServerHandle {
            local_addr,
            bank: self.bank,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a running bus.  Dropping it leaves the bus running; call
/// [`BusServerHandle::shutdown`] to stop it.
pub struct BusServerHandle {
    local_addr: SocketAddr,
    bank: Arc<RegisterBank>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BusServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bank(&self) -> Arc<RegisterBank> {
        Arc::clone(&self.bank)
    }

    /// Close the listener and every live connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
        let _ = self.task.await;
        info!(local_addr = %self.local_addr, "register bus shut down");
    }

    /// Wait until the server task ends on its own.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// GuardedStream
// ---------------------------------------------------------------------------

type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// TCP stream wrapper adding idle close and shutdown-driven EOF.
struct GuardedStream {
    inner: TcpStream,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    shutdown: ShutdownFuture,
}

impl GuardedStream {
    fn new(inner: TcpStream, idle_timeout: Duration, mut shutdown: watch::Receiver<bool>) -> Self {
        let shutdown: ShutdownFuture = Box::pin(async move {
            // A dropped sender also ends the connection.
            let _ = shutdown.wait_for(|stop| *stop).await;
        });
        Self {
            inner,
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            shutdown,
        }
    }
}

impl AsyncRead for GuardedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shutdown.as_mut().poll(cx).is_ready() {
            // Report EOF so the codec ends the connection cleanly.
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    let next = Instant::now() + this.idle_timeout;
                    this.deadline.as_mut().reset(next);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    debug!("closing idle bus connection");
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "bus connection idle",
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for GuardedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
