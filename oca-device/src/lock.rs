//! Per-object lock state machine
//!
//! A lock is held by one controller. A read-only lock lets everyone read but
//! only the holder write; a total lock blocks every other controller.

use oca_core::{LockStatus, OcaError, OcaResult, OcaStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one controller connection, unique for the lifetime of a device
pub type ControllerId = u64;

/// Lock state of one object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    #[default]
    Unlocked,
    ReadOnly(ControllerId),
    Total(ControllerId),
}

impl LockState {
    pub fn status(&self) -> LockStatus {
        match self {
            Self::Unlocked => LockStatus::NoLock,
            Self::ReadOnly(_) => LockStatus::LockNoWrite,
            Self::Total(_) => LockStatus::LockNoReadWrite,
        }
    }

    pub fn holder(&self) -> Option<ControllerId> {
        match self {
            Self::Unlocked => None,
            Self::ReadOnly(holder) | Self::Total(holder) => Some(*holder),
        }
    }

    /// Take or downgrade to a read-only lock
    pub fn lock_read_only(&mut self, controller: ControllerId) -> OcaResult<()> {
        *self = match *self {
            Self::Unlocked => Self::ReadOnly(controller),
            Self::Total(holder) if holder == controller => Self::ReadOnly(controller),
            _ => return Err(OcaError::Status(OcaStatus::Locked)),
        };
        Ok(())
    }

    /// Take or escalate to a total lock
    pub fn lock_total(&mut self, controller: ControllerId) -> OcaResult<()> {
        *self = match *self {
            Self::Unlocked => Self::Total(controller),
            Self::ReadOnly(holder) if holder == controller => Self::Total(controller),
            _ => return Err(OcaError::Status(OcaStatus::Locked)),
        };
        Ok(())
    }

    pub fn unlock(&mut self, controller: ControllerId) -> OcaResult<()> {
        match self.holder() {
            None => Err(OcaError::Status(OcaStatus::InvalidRequest)),
            Some(holder) if holder != controller => Err(OcaError::Status(OcaStatus::Locked)),
            Some(_) => {
                *self = Self::Unlocked;
                Ok(())
            }
        }
    }

    /// Drop any lock `controller` holds; returns true if one was released
    pub fn release(&mut self, controller: ControllerId) -> bool {
        if self.holder() == Some(controller) {
            *self = Self::Unlocked;
            true
        } else {
            false
        }
    }

    pub fn ensure_readable(&self, controller: ControllerId) -> OcaResult<()> {
        match *self {
            Self::Total(holder) if holder != controller => {
                Err(OcaError::Status(OcaStatus::Locked))
            }
            _ => Ok(()),
        }
    }

    pub fn ensure_writable(&self, controller: ControllerId) -> OcaResult<()> {
        match self.holder() {
            Some(holder) if holder != controller => Err(OcaError::Status(OcaStatus::Locked)),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => write!(f, "Unlocked"),
            Self::ReadOnly(holder) => write!(f, "Read locked by {}", holder),
            Self::Total(holder) => write!(f, "Read/write locked by {}", holder),
        }
    }
}
