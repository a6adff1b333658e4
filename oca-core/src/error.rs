use crate::status::OcaStatus;
use crate::types::{NotificationException, ONo};
use thiserror::Error;

/// Main error type for OCA operations
///
/// Errors fall into four groups which callers treat differently:
/// - framing/decode errors, fatal to a stream connection
/// - protocol status returned by a device, carried as [`OcaStatus`]
/// - connection lifecycle errors, local to the controller's connection
/// - property semantics errors, never sent over the wire
#[derive(Error, Debug)]
pub enum OcaError {
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device returned status {0}")]
    Status(OcaStatus),

    #[error("Device raised exception: {0}")]
    Exception(NotificationException),

    // framing and decoding
    #[error("PDU too short")]
    PduTooShort,

    #[error("Invalid sync value 0x{0:02x}")]
    InvalidSyncValue(u8),

    #[error("Invalid PDU size")]
    InvalidPduSize,

    #[error("Invalid message size")]
    InvalidMessageSize,

    #[error("Invalid message type {0}")]
    InvalidMessageType(u8),

    #[error("Unsupported protocol version {0}")]
    InvalidProtocolVersion(u16),

    #[error("Invalid keepalive PDU")]
    InvalidKeepAlivePdu,

    #[error("Bad format")]
    BadFormat,

    // connection lifecycle
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection already in progress")]
    ConnectionAlreadyInProgress,

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("Response timed out")]
    ResponseTimeout,

    #[error("Missing keepalive")]
    MissingKeepalive,

    #[error("Unknown response handle {0}")]
    InvalidHandle(u32),

    #[error("PDU sending failed")]
    PduSendingFailed,

    #[error("Operation cancelled")]
    Cancelled,

    // property semantics
    #[error("Property is immutable")]
    PropertyIsImmutable,

    #[error("Property is settable only")]
    PropertyIsSettableOnly,

    #[error("Property has no initial value")]
    NoInitialValue,

    #[error("Unhandled event")]
    UnhandledEvent,

    // subscriptions
    #[error("Already subscribed to event")]
    AlreadySubscribedToEvent,

    #[error("Not subscribed to event")]
    NotSubscribedToEvent,

    // object table
    #[error("Object {0} is already registered")]
    DuplicateObject(ONo),

    #[error("Invalid object {0}")]
    InvalidObject(ONo),

    #[error("No registered class matches {0}")]
    UnknownClass(String),

    #[error("Object class does not match")]
    ObjectClassMismatch,

    // proxied methods
    #[error("Invalid response from proxied method")]
    InvalidProxyMethodResponse,

    #[error("Value is not encodable")]
    NilNotEncodable,

    #[error("Not implemented")]
    NotImplemented,

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl OcaError {
    /// Check if the error is a framing or decode failure
    #[must_use]
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::PduTooShort
                | Self::InvalidSyncValue(_)
                | Self::InvalidPduSize
                | Self::InvalidMessageSize
                | Self::InvalidMessageType(_)
                | Self::InvalidProtocolVersion(_)
                | Self::InvalidKeepAlivePdu
                | Self::BadFormat
        )
    }

    /// Check if the error should trigger an automatic reconnection
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::MissingKeepalive | Self::ConnectionTimeout | Self::NotConnected => true,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Status a device puts in the Response when a command fails with this error
    #[must_use]
    pub fn status(&self) -> OcaStatus {
        match self {
            Self::Status(status) => *status,
            Self::InvalidProxyMethodResponse => OcaStatus::InvalidRequest,
            Self::NilNotEncodable => OcaStatus::ProcessingFailed,
            Self::InvalidObject(_) => OcaStatus::BadONo,
            Self::NotImplemented => OcaStatus::NotImplemented,
            Self::AlreadySubscribedToEvent | Self::NotSubscribedToEvent => {
                OcaStatus::InvalidRequest
            }
            Self::InvalidProtocolVersion(_) => OcaStatus::ProtocolVersionError,
            e if e.is_decode_error() => OcaStatus::BadFormat,
            _ => OcaStatus::DeviceError,
        }
    }
}

impl OcaError {
    /// Build an equivalent error for another caller
    ///
    /// An I/O error is rebuilt from its kind and message.
    #[must_use]
    pub fn replay(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Status(status) => Self::Status(*status),
            Self::Exception(exception) => Self::Exception(exception.clone()),
            Self::PduTooShort => Self::PduTooShort,
            Self::InvalidSyncValue(value) => Self::InvalidSyncValue(*value),
            Self::InvalidPduSize => Self::InvalidPduSize,
            Self::InvalidMessageSize => Self::InvalidMessageSize,
            Self::InvalidMessageType(value) => Self::InvalidMessageType(*value),
            Self::InvalidProtocolVersion(version) => Self::InvalidProtocolVersion(*version),
            Self::InvalidKeepAlivePdu => Self::InvalidKeepAlivePdu,
            Self::BadFormat => Self::BadFormat,
            Self::NotConnected => Self::NotConnected,
            Self::AlreadyConnected => Self::AlreadyConnected,
            Self::ConnectionAlreadyInProgress => Self::ConnectionAlreadyInProgress,
            Self::ConnectionTimeout => Self::ConnectionTimeout,
            Self::ResponseTimeout => Self::ResponseTimeout,
            Self::MissingKeepalive => Self::MissingKeepalive,
            Self::InvalidHandle(handle) => Self::InvalidHandle(*handle),
            Self::PduSendingFailed => Self::PduSendingFailed,
            Self::Cancelled => Self::Cancelled,
            Self::PropertyIsImmutable => Self::PropertyIsImmutable,
            Self::PropertyIsSettableOnly => Self::PropertyIsSettableOnly,
            Self::NoInitialValue => Self::NoInitialValue,
            Self::UnhandledEvent => Self::UnhandledEvent,
            Self::AlreadySubscribedToEvent => Self::AlreadySubscribedToEvent,
            Self::NotSubscribedToEvent => Self::NotSubscribedToEvent,
            Self::DuplicateObject(ono) => Self::DuplicateObject(*ono),
            Self::InvalidObject(ono) => Self::InvalidObject(*ono),
            Self::UnknownClass(class) => Self::UnknownClass(class.clone()),
            Self::ObjectClassMismatch => Self::ObjectClassMismatch,
            Self::InvalidProxyMethodResponse => Self::InvalidProxyMethodResponse,
            Self::NilNotEncodable => Self::NilNotEncodable,
            Self::NotImplemented => Self::NotImplemented,
            Self::InvalidData(message) => Self::InvalidData(message.clone()),
        }
    }
}

impl From<OcaStatus> for OcaError {
    fn from(status: OcaStatus) -> Self {
        Self::Status(status)
    }
}

/// Result type alias for OCA operations
pub type OcaResult<T> = Result<T, OcaError>;
