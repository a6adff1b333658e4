//! OCA controller
//!
//! Connects to a device over any [`oca_transport::TransportLayer`], calls
//! methods on its objects and keeps proxies of those objects with their
//! property values in sync through event subscriptions.
//!
//! # Usage
//!
//! ```no_run
//! use oca_controller::{Connection, ConnectionOptions};
//! use oca_transport::TcpConnector;
//! use std::sync::Arc;
//!
//! # async fn run() -> oca_core::OcaResult<()> {
//! let transport = Arc::new(TcpConnector::from_address("192.168.1.20:65000")?);
//! let connection = Connection::new(transport, ConnectionOptions::default());
//! connection.connect().await?;
//! let root = connection.resolve_object(oca_core::well_known::ROOT_BLOCK_ONO).await?;
//! println!("{}", root);
//! connection.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod connection;
mod monitor;
pub mod object;
pub mod options;
pub mod property;
pub mod state;

pub use cache::ObjectCache;
pub use connection::{Connection, EventCallback, SubscriptionToken};
pub use monitor::{FIRST_HANDLE, MISSED_KEEPALIVE_LIMIT};
pub use object::{ObjectFactory, RemoteObject};
pub use options::{BatchingOptions, ConnectionFlags, ConnectionOptions, ReconnectionPolicy};
pub use property::{
    AnyProperty, CommandChannel, Property, PropertyContainer, PropertyResolutionFlags,
    PropertyValue,
};
pub use state::ConnectionState;
