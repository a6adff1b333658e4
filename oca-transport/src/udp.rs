//! UDP transport implementation
//!
//! Every write is sent as one datagram and every datagram carries whole PDUs,
//! so a decode error only invalidates the datagram it came from.

use crate::stream::{StreamAccessor, TransportLayer};
use async_trait::async_trait;
use oca_core::{OcaError, OcaResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// Maximum UDP payload size
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65507;

/// Largest datagram the batcher assembles for UDP (Ethernet MTU minus IP/UDP headers)
pub const UDP_BATCH_SIZE: usize = 1472;

/// UDP transport layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpSettings {
    pub remote_address: SocketAddr,
    /// Timeout for receiving one datagram
    pub timeout: Option<Duration>,
}

impl UdpSettings {
    /// Create new UDP settings
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            remote_address,
            timeout: None,
        }
    }

    /// Create UDP settings with timeout
    pub fn with_timeout(remote_address: SocketAddr, timeout: Duration) -> Self {
        Self {
            remote_address,
            timeout: Some(timeout),
        }
    }
}

/// UDP transport layer implementation
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    settings: UdpSettings,
    closed: AtomicBool,
    /// Unread tail of the last datagram, for byte-oriented reads
    pending: Mutex<Vec<u8>>,
}

impl UdpTransport {
    /// Wrap a socket already connected to the remote address
    pub fn new(socket: UdpSocket, settings: UdpSettings) -> Self {
        Self {
            socket,
            settings,
            closed: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    async fn next_datagram(&self) -> OcaResult<Vec<u8>> {
        if self.is_closed() {
            return Err(OcaError::NotConnected);
        }
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];
        let len = if let Some(timeout) = self.settings.timeout {
            tokio::time::timeout(timeout, self.socket.recv(&mut buf))
                .await
                .map_err(|_| OcaError::ResponseTimeout)??
        } else {
            self.socket.recv(&mut buf).await?
        };
        buf.truncate(len);
        log::trace!("UDP received {} bytes from {}", len, self.settings.remote_address);
        Ok(buf)
    }
}

#[async_trait]
impl StreamAccessor for UdpTransport {
    async fn read_exact(&self, len: usize) -> OcaResult<Vec<u8>> {
        let mut pending = self.pending.lock().await;
        while pending.len() < len {
            let datagram = self.next_datagram().await?;
            pending.extend_from_slice(&datagram);
        }
        let rest = pending.split_off(len);
        Ok(std::mem::replace(&mut *pending, rest))
    }

    async fn receive_datagram(&self) -> OcaResult<Vec<u8>> {
        self.next_datagram().await
    }

    async fn write(&self, buf: &[u8]) -> OcaResult<usize> {
        if self.is_closed() {
            return Err(OcaError::NotConnected);
        }
        if buf.len() > MAX_UDP_PAYLOAD_SIZE {
            return Err(OcaError::PduSendingFailed);
        }
        Ok(self.socket.send(buf).await?)
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        Some(self.settings.remote_address)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> OcaResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Opens UDP "connections" (connected sockets) to a fixed device address
#[derive(Debug, Clone)]
pub struct UdpConnector {
    settings: UdpSettings,
}

impl UdpConnector {
    pub fn new(settings: UdpSettings) -> Self {
        Self { settings }
    }

    /// Create UDP connector from address string
    pub fn from_address(address: &str) -> OcaResult<Self> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| OcaError::InvalidData(format!("Invalid UDP address: {}", e)))?;
        Ok(Self::new(UdpSettings::new(addr)))
    }
}

#[async_trait]
impl TransportLayer for UdpConnector {
    async fn open(&self) -> OcaResult<Arc<dyn StreamAccessor>> {
        let local: SocketAddr = if self.settings.remote_address.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.settings.remote_address).await?;
        Ok(Arc::new(UdpTransport::new(socket, self.settings.clone())))
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        format!("udp://{}", self.settings.remote_address)
    }
}
