//! OCA status codes
//!
//! Every Response carries one of these codes. They travel end-to-end as typed
//! values: a device returns them, the controller surfaces them through
//! [`OcaError::Status`](crate::OcaError::Status).

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Status code returned by a device in a Response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OcaStatus {
    Ok = 0,
    ProtocolVersionError = 1,
    DeviceError = 2,
    Locked = 3,
    BadFormat = 4,
    BadONo = 5,
    ParameterError = 6,
    ParameterOutOfRange = 7,
    NotImplemented = 8,
    InvalidRequest = 9,
    ProcessingFailed = 10,
    BadMethod = 11,
    PartiallySucceeded = 12,
    Timeout = 13,
    BufferOverflow = 14,
}

impl OcaStatus {
    /// Check if this status reports success
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Check if this status describes a capability the device will never have
    ///
    /// Capabilities are assumed static for the lifetime of a device, so a
    /// cached `NotImplemented` can be returned without asking again.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::NotImplemented)
    }

    /// Raw wire value
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for OcaStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::ProtocolVersionError,
            2 => Self::DeviceError,
            3 => Self::Locked,
            4 => Self::BadFormat,
            5 => Self::BadONo,
            6 => Self::ParameterError,
            7 => Self::ParameterOutOfRange,
            8 => Self::NotImplemented,
            9 => Self::InvalidRequest,
            10 => Self::ProcessingFailed,
            11 => Self::BadMethod,
            12 => Self::PartiallySucceeded,
            13 => Self::Timeout,
            14 => Self::BufferOverflow,
            other => return Err(other),
        })
    }
}

impl Display for OcaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::ProtocolVersionError => "protocolVersionError",
            Self::DeviceError => "deviceError",
            Self::Locked => "locked",
            Self::BadFormat => "badFormat",
            Self::BadONo => "badONo",
            Self::ParameterError => "parameterError",
            Self::ParameterOutOfRange => "parameterOutOfRange",
            Self::NotImplemented => "notImplemented",
            Self::InvalidRequest => "invalidRequest",
            Self::ProcessingFailed => "processingFailed",
            Self::BadMethod => "badMethod",
            Self::PartiallySucceeded => "partiallySucceeded",
            Self::Timeout => "timeout",
            Self::BufferOverflow => "bufferOverflow",
        };
        write!(f, "{}", name)
    }
}
