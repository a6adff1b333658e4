//! TCP transport implementation

use crate::stream::{StreamAccessor, TransportLayer};
use async_trait::async_trait;
use oca_core::{OcaError, OcaResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

/// TCP transport layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSettings {
    pub address: SocketAddr,
    /// Timeout for establishing the connection
    pub timeout: Option<Duration>,
    pub no_delay: bool,
}

impl TcpSettings {
    /// Create new TCP settings
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            timeout: Some(Duration::from_secs(2)),
            no_delay: true,
        }
    }

    /// Create TCP settings with timeout
    pub fn with_timeout(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new(address)
        }
    }
}

/// Byte stream over any split reader/writer pair
///
/// Used for TCP connections and, in tests, for in-memory duplex pipes.
pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
}

impl<R, W> fmt::Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// TCP transport layer implementation
pub type TcpTransport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

impl StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    /// Wrap an already-connected TcpStream (for device use)
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let transport = Self::new(reader, writer);
        match peer {
            Some(peer) => transport.with_peer(peer),
            None => transport,
        }
    }
}

impl<T> StreamTransport<tokio::io::ReadHalf<T>, tokio::io::WriteHalf<T>>
where
    T: AsyncRead + AsyncWrite + Send,
{
    /// Wrap a bidirectional stream such as `tokio::io::DuplexStream`
    pub fn from_stream(stream: T) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer: None,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> StreamAccessor for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_exact(&self, len: usize) -> OcaResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut reader = self.reader.lock().await;
        match reader.read_exact(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                Err(OcaError::Io(e))
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> OcaResult<usize> {
        if self.is_closed() {
            return Err(OcaError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        match writer.write(buf).await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                Err(OcaError::Io(e))
            }
        }
    }

    async fn write_all(&self, buf: &[u8]) -> OcaResult<()> {
        if self.is_closed() {
            return Err(OcaError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let result = match writer.write_all(buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            self.closed.store(true, Ordering::Release);
            OcaError::Io(e)
        })
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> OcaResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

/// Opens TCP connections to a fixed device address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    settings: TcpSettings,
}

impl TcpConnector {
    pub fn new(settings: TcpSettings) -> Self {
        Self { settings }
    }

    /// Create TCP connector from address string
    pub fn from_address(address: &str) -> OcaResult<Self> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| OcaError::InvalidData(format!("Invalid TCP address: {}", e)))?;
        Ok(Self::new(TcpSettings::new(addr)))
    }

    pub fn settings(&self) -> &TcpSettings {
        &self.settings
    }
}

#[async_trait]
impl TransportLayer for TcpConnector {
    async fn open(&self) -> OcaResult<Arc<dyn StreamAccessor>> {
        let stream = if let Some(timeout) = self.settings.timeout {
            tokio::time::timeout(timeout, TcpStream::connect(self.settings.address))
                .await
                .map_err(|_| OcaError::ConnectionTimeout)??
        } else {
            TcpStream::connect(self.settings.address).await?
        };
        stream.set_nodelay(self.settings.no_delay)?;
        log::debug!("TCP connection to {} established", self.settings.address);
        Ok(Arc::new(TcpTransport::from_tcp(stream)))
    }

    fn description(&self) -> String {
        format!("tcp://{}", self.settings.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_settings() {
        let addr: SocketAddr = "127.0.0.1:65000".parse().unwrap();
        let settings = TcpSettings::new(addr);
        assert_eq!(settings.address, addr);
        assert_eq!(settings.timeout, Some(Duration::from_secs(2)));

        let settings = TcpSettings::with_timeout(addr, Duration::from_millis(100));
        assert_eq!(settings.timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_connector_from_bad_address() {
        assert!(TcpConnector::from_address("not an address").is_err());
    }

    #[tokio::test]
    async fn test_stream_transport_read_and_write() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x3B, 0x00])
            .read(&[0x01])
            .write(&[1, 2, 3])
            .build();
        let transport = StreamTransport::from_stream(mock);

        assert_eq!(transport.read_exact(3).await.unwrap(), vec![0x3B, 0x00, 0x01]);
        transport.write_all(&[1, 2, 3]).await.unwrap();
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_stream_transport_eof_closes() {
        let mock = tokio_test::io::Builder::new().read(&[0x3B]).build();
        let transport = StreamTransport::from_stream(mock);

        let err = transport.read_exact(4).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(transport.is_closed());
        assert!(matches!(
            transport.write(&[0]).await,
            Err(OcaError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport = TcpTransport::from_tcp(stream);
            let data = transport.read_exact(2).await.unwrap();
            transport.write_all(&data).await.unwrap();
        });

        let connector = TcpConnector::new(TcpSettings::new(addr));
        let transport = connector.open().await.unwrap();
        transport.write_all(&[7, 8]).await.unwrap();
        assert_eq!(transport.read_exact(2).await.unwrap(), vec![7, 8]);
        assert_eq!(connector.description(), format!("tcp://{}", addr));
        server.await.unwrap();
    }
}
