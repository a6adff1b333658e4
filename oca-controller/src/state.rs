//! Connection state

use oca_core::OcaError;
use std::fmt;

/// Lifecycle state of a controller connection
///
/// Published through a `tokio::sync::watch` channel so applications can
/// follow connection changes; see [`Connection::state_changes`].
///
/// [`Connection::state_changes`]: crate::Connection::state_changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link (initial state)
    #[default]
    NotConnected,
    /// Opening the transport
    Connecting,
    /// Link is up
    Connected,
    /// Re-establishing a lost link
    Reconnecting,
    /// Tearing down the link on request
    Disconnecting,
    /// The last connection attempt or the link timed out
    ConnectionTimedOut,
    /// The last connection attempt or the link failed
    ConnectionFailed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a connection attempt is under way
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Check if the link was lost rather than closed on request
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::ConnectionTimedOut | Self::ConnectionFailed)
    }

    /// State reached when a connection fails with `error`
    pub fn from_error(error: &OcaError) -> Self {
        match error {
            OcaError::NotConnected => Self::NotConnected,
            OcaError::ConnectionTimeout | OcaError::MissingKeepalive => Self::ConnectionTimedOut,
            _ => Self::ConnectionFailed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotConnected => "not connected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
            Self::ConnectionTimedOut => "connection timed out",
            Self::ConnectionFailed => "connection failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_error() {
        assert_eq!(
            ConnectionState::from_error(&OcaError::NotConnected),
            ConnectionState::NotConnected
        );
        assert_eq!(
            ConnectionState::from_error(&OcaError::ConnectionTimeout),
            ConnectionState::ConnectionTimedOut
        );
        assert_eq!(
            ConnectionState::from_error(&OcaError::MissingKeepalive),
            ConnectionState::ConnectionTimedOut
        );
        let reset = OcaError::Io(std::io::ErrorKind::ConnectionReset.into());
        assert_eq!(
            ConnectionState::from_error(&reset),
            ConnectionState::ConnectionFailed
        );
        assert!(ConnectionState::ConnectionFailed.is_failed());
        assert!(!ConnectionState::NotConnected.is_failed());
        assert!(ConnectionState::Reconnecting.is_connecting());
    }
}
