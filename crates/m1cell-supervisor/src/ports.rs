//! Socket-level liveness probes and the OS serial port survey.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_serial::SerialPortType;
use tracing::{debug, warn};

/// Connect timeout for a single liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// `true` when something accepts TCP connections on `host:port`.
pub async fn port_accepts(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "port probe refused");
            false
        }
        Err(_) => {
            debug!(host, port, "port probe timed out");
            false
        }
    }
}

/// One serial device visible to the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortEntry {
    pub port_name: String,
    /// `usb`, `pci`, `bluetooth` or `unknown`.
    pub port_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Enumerate serial devices, sorted by name with duplicates removed.
///
/// Enumeration failures yield an empty list; a missing driver is not an
/// error for the dashboard.
pub fn scan_serial_ports() -> Vec<SerialPortEntry> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!(error = %e, "serial port enumeration failed");
            return Vec::new();
        }
    };
    let mut entries: Vec<SerialPortEntry> = ports
        .into_iter()
        .map(|p| {
            let (port_type, description) = match p.port_type {
                SerialPortType::UsbPort(info) => {
                    let desc = match (info.manufacturer, info.product) {
                        (Some(m), Some(p)) => Some(format!("{m} {p}")),
                        (m, p) => m.or(p),
                    };
                    ("usb", desc)
                }
                SerialPortType::PciPort => ("pci", None),
                SerialPortType::BluetoothPort => ("bluetooth", None),
                SerialPortType::Unknown => ("unknown", None),
            };
            SerialPortEntry {
                port_name: p.port_name,
                port_type: port_type.to_string(),
                description,
            }
        })
        .collect();
    entries.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    entries.dedup_by(|a, b| a.port_name == b.port_name);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_sees_listener_come_and_go() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        assert!(port_accepts("127.0.0.1", port, PROBE_TIMEOUT).await);
        drop(listener);
        assert!(!port_accepts("127.0.0.1", port, PROBE_TIMEOUT).await);
        Ok(())
    }

    #[test]
    fn scan_is_sorted_and_unique() {
        let ports = scan_serial_ports();
        let mut names: Vec<_> = ports.iter().map(|p| p.port_name.clone()).collect();
        let before = names.clone();
        names.sort();
        names.dedup();
        assert_eq!(before, names);
    }
}
