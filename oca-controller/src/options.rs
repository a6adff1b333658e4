//! Connection configuration
//!
//! All options have defaults suited to a device on the local network; use the
//! `with_*` methods to adjust them, or deserialize them from a configuration
//! file.

use oca_ocp1::{CodecOptions, default_batch_size, default_dequeue_interval};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Behaviour switches of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionFlags {
    /// Reconnect after the link fails
    pub automatic_reconnect: bool,
    /// Resolve the root block when a connection is established
    pub refresh_device_tree_on_connection: bool,
    /// Keep object proxies across an explicit disconnect
    pub retain_object_cache_after_disconnect: bool,
    /// Replay event subscriptions after a reconnection
    pub refresh_subscriptions_on_reconnection: bool,
    /// Use the extension-aware Command/Response layout
    pub enable_extensions: bool,
}

impl Default for ConnectionFlags {
    fn default() -> Self {
        Self {
            automatic_reconnect: false,
            refresh_device_tree_on_connection: false,
            retain_object_cache_after_disconnect: false,
            refresh_subscriptions_on_reconnection: true,
            enable_extensions: false,
        }
    }
}

/// Outgoing message batching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingOptions {
    /// Largest PDU the batcher assembles, header included
    pub batch_size: usize,
    /// Longest time a message waits in a batch
    pub batch_threshold: Duration,
}

impl BatchingOptions {
    pub fn new(batch_size: usize, batch_threshold: Duration) -> Self {
        Self {
            batch_size,
            batch_threshold,
        }
    }

    /// Batching sized for the transport, flushed at a hundredth of the heartbeat
    pub fn for_transport(is_datagram: bool, heartbeat: Duration) -> Self {
        Self::new(
            default_batch_size(is_datagram),
            default_dequeue_interval(heartbeat),
        )
    }
}

/// How a lost connection is re-established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionPolicy {
    /// Stay disconnected
    NoReconnect,
    /// Reconnect when the application next sends a command
    ReconnectOnSend,
    /// Reconnect as soon as the keepalive monitor notices the failure
    ReconnectInMonitor,
}

/// Controller connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub flags: ConnectionFlags,
    /// Time allowed for the transport to connect
    pub connection_timeout: Duration,
    /// Time allowed for each command's response
    pub response_timeout: Duration,
    /// Keepalive interval; zero disables keepalives
    pub heartbeat: Duration,
    /// Pause after the first failed reconnection attempt
    pub reconnect_pause_interval: Duration,
    pub reconnect_max_tries: u32,
    /// Attempts after which the pause doubles
    pub reconnect_exponential_backoff_threshold: RangeInclusive<u32>,
    /// Most object proxies kept alive by the cache
    pub object_cache_capacity: usize,
    /// Batching of outgoing messages; `None` sends every message on its own
    pub batching: Option<BatchingOptions>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            flags: ConnectionFlags::default(),
            connection_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(2),
            heartbeat: Duration::from_secs(1),
            reconnect_pause_interval: Duration::from_millis(250),
            reconnect_max_tries: 15,
            reconnect_exponential_backoff_threshold: 3..=8,
            object_cache_capacity: 1000,
            batching: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(mut self, flags: ConnectionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_automatic_reconnect(mut self, enabled: bool) -> Self {
        self.flags.automatic_reconnect = enabled;
        self
    }

    pub fn with_retained_object_cache(mut self, retain: bool) -> Self {
        self.flags.retain_object_cache_after_disconnect = retain;
        self
    }

    pub fn with_extensions(mut self, enabled: bool) -> Self {
        self.flags.enable_extensions = enabled;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_reconnect_pause(mut self, pause: Duration, max_tries: u32) -> Self {
        self.reconnect_pause_interval = pause;
        self.reconnect_max_tries = max_tries;
        self
    }

    pub fn with_object_cache_capacity(mut self, capacity: usize) -> Self {
        self.object_cache_capacity = capacity;
        self
    }

    pub fn with_batching(mut self, batching: BatchingOptions) -> Self {
        self.batching = Some(batching);
        self
    }

    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            extensions: self.flags.enable_extensions,
        }
    }

    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        if !self.flags.automatic_reconnect {
            ReconnectionPolicy::NoReconnect
        } else if self.heartbeat.is_zero() {
            ReconnectionPolicy::ReconnectOnSend
        } else {
            ReconnectionPolicy::ReconnectInMonitor
        }
    }
}
