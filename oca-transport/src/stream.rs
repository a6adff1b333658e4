//! Stream accessor trait for transport layer

use async_trait::async_trait;
use oca_core::{OcaError, OcaResult};
use std::net::SocketAddr;
use std::sync::Arc;

/// Byte-level access to one open connection
///
/// Methods take `&self` so that a connection's read loop and its writers can
/// use the transport concurrently; implementations keep their read and write
/// sides behind separate locks.
#[async_trait]
pub trait StreamAccessor: Send + Sync {
    /// Read exactly `len` bytes
    ///
    /// Suspends until all bytes arrived. End of stream is reported as an
    /// `UnexpectedEof` I/O error.
    async fn read_exact(&self, len: usize) -> OcaResult<Vec<u8>>;

    /// Receive one whole datagram
    ///
    /// Only datagram transports implement this.
    async fn receive_datagram(&self) -> OcaResult<Vec<u8>> {
        Err(OcaError::NotImplemented)
    }

    /// Write data, returning the number of bytes written
    async fn write(&self, buf: &[u8]) -> OcaResult<usize>;

    /// Write all data
    async fn write_all(&self, buf: &[u8]) -> OcaResult<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..]).await?;
            if n == 0 {
                return Err(OcaError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "Failed to write all data",
                )));
            }
            written += n;
        }
        Ok(())
    }

    /// Check if each write is delivered as one datagram
    fn is_datagram(&self) -> bool {
        false
    }

    /// Address of the remote peer, when known
    fn peer_address(&self) -> Option<SocketAddr> {
        None
    }

    /// Check if the stream is closed
    fn is_closed(&self) -> bool;

    /// Close the stream
    async fn close(&self) -> OcaResult<()>;
}

/// Factory of connections to one remote endpoint
///
/// The controller reopens its transport through this on every
/// (re)connection attempt.
#[async_trait]
pub trait TransportLayer: Send + Sync {
    /// Open a fresh connection
    async fn open(&self) -> OcaResult<Arc<dyn StreamAccessor>>;

    /// Check if connections from this layer are datagram based
    fn is_datagram(&self) -> bool {
        false
    }

    /// Human-readable endpoint description for logging
    fn description(&self) -> String;
}
