//! Transport layer module for the OCP.1 protocol
//!
//! This crate provides byte transports for TCP, UDP and any tokio
//! `AsyncRead + AsyncWrite` stream.

pub mod stream;
pub mod tcp;
pub mod udp;

pub use stream::{StreamAccessor, TransportLayer};
pub use tcp::{StreamTransport, TcpConnector, TcpSettings, TcpTransport};
pub use udp::{MAX_UDP_PAYLOAD_SIZE, UDP_BATCH_SIZE, UdpConnector, UdpSettings, UdpTransport};
