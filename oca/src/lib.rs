//! AES70 (OCA) over OCP.1
//!
//! This library implements both ends of the OCA control protocol: a
//! controller that connects to devices and mirrors their objects, and a device
//! runtime that serves objects to any number of controllers.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `oca-core`: Core types, status codes, error handling and the binary encoding
//! - `oca-ocp1`: OCP.1 messages, PDU framing and message batching
//! - `oca-transport`: Transports (TCP, UDP, in-memory streams)
//! - `oca-controller`: Connection engine, object cache and remote properties
//! - `oca-device`: Device objects, locking and event subscriptions
//!
//! # Usage
//!
//! ```no_run
//! use oca::controller::{Connection, ConnectionOptions};
//! ```

// Re-export core types
pub use oca_core::*;

// Re-export the wire protocol
pub mod ocp1 {
    pub use oca_ocp1::*;
}

// Re-export transports
pub mod transport {
    pub use oca_transport::*;
}

// Re-export controller API
pub mod controller {
    pub use oca_controller::*;
}

// Re-export device API
pub mod device {
    pub use oca_device::*;
}
