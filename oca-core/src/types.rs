//! Identifiers and base data types of the OCA object model

use crate::error::{OcaError, OcaResult};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Object number, unique within one device
pub type ONo = u32;

/// Class version number
pub type ClassVersion = u16;

fn parse_pair(s: &str) -> OcaResult<(u16, u16)> {
    let (level, index) = s
        .split_once('.')
        .ok_or_else(|| OcaError::InvalidData(format!("expected \"level.index\", got {:?}", s)))?;
    let level = level
        .parse()
        .map_err(|_| OcaError::InvalidData(format!("invalid definition level in {:?}", s)))?;
    let index = index
        .parse()
        .map_err(|_| OcaError::InvalidData(format!("invalid index in {:?}", s)))?;
    Ok((level, index))
}

macro_rules! level_index_id {
    ($(#[$meta:meta])* $name:ident, $index:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            pub def_level: u16,
            pub $index: u16,
        }

        impl $name {
            #[must_use]
            pub const fn new(def_level: u16, $index: u16) -> Self {
                Self { def_level, $index }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.def_level, self.$index)
            }
        }

        impl FromStr for $name {
            type Err = OcaError;

            fn from_str(s: &str) -> OcaResult<Self> {
                let (def_level, $index) = parse_pair(s)?;
                Ok(Self { def_level, $index })
            }
        }
    };
}

level_index_id!(
    /// Method identifier, scoped to a class definition level
    MethodID,
    method_index
);
level_index_id!(
    /// Property identifier, scoped to a class definition level
    PropertyID,
    property_index
);
level_index_id!(
    /// Event identifier, scoped to a class definition level
    EventID,
    event_index
);

/// An event raised by a specific object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Event {
    pub emitter_ono: ONo,
    pub event_id: EventID,
}

impl Event {
    #[must_use]
    pub const fn new(emitter_ono: ONo, event_id: EventID) -> Self {
        Self {
            emitter_ono,
            event_id,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.emitter_ono, self.event_id)
    }
}

/// A method on a specific object; used to name a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Method {
    pub ono: ONo,
    pub method_id: MethodID,
}

impl Method {
    #[must_use]
    pub const fn new(ono: ONo, method_id: MethodID) -> Self {
        Self { ono, method_id }
    }
}

/// Hierarchical class identifier, e.g. `1.1.3`
///
/// The first field is always 1 (OcaRoot). A proprietary subclass inserts the
/// marker field `0xFFFF` followed by the 24-bit organization identifier packed
/// into two fields; that group is removed as a unit when walking to the parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassID {
    fields: Vec<u16>,
}

impl ClassID {
    pub const PROPRIETARY_CLASS_FIELD_MASK: u16 = 0x8000;
    pub const PROPRIETARY_TEST_CLASS_FIELD_MASK: u16 = 0xFF00;
    pub const PROPRIETARY_CLASS_FIELD: u16 = 0xFFFF;

    #[must_use]
    pub fn new(fields: Vec<u16>) -> Self {
        Self { fields }
    }

    /// Append a field to a parent class
    #[must_use]
    pub fn child(&self, field: u16) -> Self {
        let mut fields = self.fields.clone();
        fields.push(field);
        Self { fields }
    }

    pub fn fields(&self) -> &[u16] {
        &self.fields
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Parent class, or `None` for OcaRoot
    #[must_use]
    pub fn parent(&self) -> Option<ClassID> {
        if self.fields.len() <= 1 {
            return None;
        }

        let mut parent_count = self.fields.len() - 1;
        if parent_count >= 4 && self.fields[parent_count - 3] == Self::PROPRIETARY_CLASS_FIELD {
            parent_count -= 3;
        }

        Some(Self {
            fields: self.fields[..parent_count].to_vec(),
        })
    }

    /// Definition level, not counting the proprietary marker and company ID
    #[must_use]
    pub fn def_level(&self) -> u16 {
        if !self.is_valid() {
            return 0;
        }
        let count = self.fields.len() as u16;
        if self.fields.contains(&Self::PROPRIETARY_CLASS_FIELD) {
            count.saturating_sub(3)
        } else {
            count
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.fields.first() != Some(&1) {
            return false;
        }

        let mut proprietary_class = false;
        let mut test_class = false;
        let mut proprietary_field_present = false;

        for (i, &field) in self.fields.iter().enumerate() {
            if field != Self::PROPRIETARY_CLASS_FIELD {
                if proprietary_class && !proprietary_field_present {
                    let proprietary =
                        field & Self::PROPRIETARY_CLASS_FIELD_MASK == Self::PROPRIETARY_CLASS_FIELD_MASK;
                    let test = test_class
                        && field & Self::PROPRIETARY_TEST_CLASS_FIELD_MASK
                            == Self::PROPRIETARY_TEST_CLASS_FIELD_MASK;
                    if !proprietary && !test {
                        return false;
                    }
                }
            } else {
                if self.fields.len() - i < 3 || proprietary_class {
                    return false;
                }
                proprietary_field_present = true;
            }

            proprietary_class =
                field & Self::PROPRIETARY_CLASS_FIELD_MASK == Self::PROPRIETARY_CLASS_FIELD_MASK;
            test_class = field & Self::PROPRIETARY_TEST_CLASS_FIELD_MASK
                == Self::PROPRIETARY_TEST_CLASS_FIELD_MASK
                && field != Self::PROPRIETARY_CLASS_FIELD;
        }

        true
    }
}

impl Display for ClassID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.fields.iter().map(u16::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl FromStr for ClassID {
    type Err = OcaError;

    fn from_str(s: &str) -> OcaResult<Self> {
        let fields = s
            .split('.')
            .map(|field| {
                field
                    .parse::<u16>()
                    .map_err(|_| OcaError::InvalidData(format!("invalid class ID {:?}", s)))
            })
            .collect::<OcaResult<Vec<u16>>>()?;
        Ok(Self { fields })
    }
}

/// Class identity of an object: class ID plus class version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassIdentification {
    pub class_id: ClassID,
    pub class_version: ClassVersion,
}

impl ClassIdentification {
    #[must_use]
    pub fn new(class_id: ClassID, class_version: ClassVersion) -> Self {
        Self {
            class_id,
            class_version,
        }
    }
}

impl Display for ClassIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.class_id, self.class_version)
    }
}

/// Object number plus class identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentification {
    pub ono: ONo,
    pub class_identification: ClassIdentification,
}

/// Opaque length-prefixed byte string
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Network address blob used as a lightweight notification destination
pub type NetworkAddress = Blob;

/// Two-dimensional list, encoded as `nx`, `ny`, then items row by row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct List2D<T> {
    pub nx: u16,
    pub ny: u16,
    pub items: Vec<T>,
}

impl<T> List2D<T> {
    pub fn get(&self, x: u16, y: u16) -> Option<&T> {
        if x >= self.nx || y >= self.ny {
            return None;
        }
        self.items.get(usize::from(x) * usize::from(self.ny) + usize::from(y))
    }

    pub fn get_mut(&mut self, x: u16, y: u16) -> Option<&mut T> {
        if x >= self.nx || y >= self.ny {
            return None;
        }
        self.items
            .get_mut(usize::from(x) * usize::from(self.ny) + usize::from(y))
    }
}

/// Kind of change carried in a property-changed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PropertyChangeType {
    CurrentChanged = 1,
    MinChanged = 2,
    MaxChanged = 3,
    ItemAdded = 4,
    ItemChanged = 5,
    ItemDeleted = 6,
}

impl PropertyChangeType {
    /// Check if this change refers to a single item of a container
    #[must_use]
    pub const fn is_item_change(&self) -> bool {
        matches!(self, Self::ItemAdded | Self::ItemChanged | Self::ItemDeleted)
    }
}

impl TryFrom<u8> for PropertyChangeType {
    type Error = OcaError;

    fn try_from(value: u8) -> OcaResult<Self> {
        Ok(match value {
            1 => Self::CurrentChanged,
            2 => Self::MinChanged,
            3 => Self::MaxChanged,
            4 => Self::ItemAdded,
            5 => Self::ItemChanged,
            6 => Self::ItemDeleted,
            _ => return Err(OcaError::BadFormat),
        })
    }
}

/// How a device delivers notifications for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NotificationDeliveryMode {
    /// Inline on the connection the subscription was made on
    Normal = 1,
    /// Out of band, to the subscription's destination address
    Lightweight = 2,
}

impl TryFrom<u8> for NotificationDeliveryMode {
    type Error = OcaError;

    fn try_from(value: u8) -> OcaResult<Self> {
        match value {
            1 => Ok(Self::Normal),
            2 => Ok(Self::Lightweight),
            _ => Err(OcaError::BadFormat),
        }
    }
}

/// Lock state of a device object as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockStatus {
    NoLock = 0,
    LockNoWrite = 1,
    LockNoReadWrite = 2,
}

impl TryFrom<u8> for LockStatus {
    type Error = OcaError;

    fn try_from(value: u8) -> OcaResult<Self> {
        match value {
            0 => Ok(Self::NoLock),
            1 => Ok(Self::LockNoWrite),
            2 => Ok(Self::LockNoReadWrite),
            _ => Err(OcaError::BadFormat),
        }
    }
}

/// Kind of exception reported through an EV2 notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NotificationExceptionType {
    Unspecified = 0,
    CancelledByDevice = 1,
    ObjectDeleted = 2,
    DeviceError = 3,
}

impl TryFrom<u8> for NotificationExceptionType {
    type Error = OcaError;

    fn try_from(value: u8) -> OcaResult<Self> {
        Ok(match value {
            0 => Self::Unspecified,
            1 => Self::CancelledByDevice,
            2 => Self::ObjectDeleted,
            3 => Self::DeviceError,
            _ => return Err(OcaError::BadFormat),
        })
    }
}

/// Exception payload of an EV2 notification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationException {
    pub exception_type: NotificationExceptionType,
    pub try_again: bool,
    pub data: Blob,
}

impl Display for NotificationException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} (try again: {}, {} bytes)",
            self.exception_type,
            self.try_again,
            self.data.0.len()
        )
    }
}
