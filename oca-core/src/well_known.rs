//! Reserved object numbers and well-known method, property and event IDs

use crate::types::{EventID, MethodID, ONo, PropertyID};

pub const INVALID_ONO: ONo = 0;
pub const DEVICE_MANAGER_ONO: ONo = 1;
pub const SECURITY_MANAGER_ONO: ONo = 2;
pub const FIRMWARE_MANAGER_ONO: ONo = 3;
pub const SUBSCRIPTION_MANAGER_ONO: ONo = 4;
pub const POWER_MANAGER_ONO: ONo = 5;
pub const NETWORK_MANAGER_ONO: ONo = 6;
pub const MEDIA_CLOCK_MANAGER_ONO: ONo = 7;
pub const LIBRARY_MANAGER_ONO: ONo = 8;
pub const AUDIO_PROCESSING_MANAGER_ONO: ONo = 9;
pub const DEVICE_TIME_MANAGER_ONO: ONo = 10;
pub const TASK_MANAGER_ONO: ONo = 11;
pub const CODING_MANAGER_ONO: ONo = 12;
pub const DIAGNOSTICS_MANAGER_ONO: ONo = 13;
pub const ROOT_BLOCK_ONO: ONo = 100;
/// Highest object number reserved by the standard
pub const MAXIMUM_RESERVED_ONO: ONo = 4095;

/// Object number a controller names as the EV1 subscriber method target
pub const DEFAULT_SUBSCRIBER_ONO: ONo = 1055;
pub const DEFAULT_SUBSCRIBER_METHOD_ID: MethodID = MethodID::new(1, 1);

/// Generic property-changed event raised by every object
pub const PROPERTY_CHANGED_EVENT_ID: EventID = EventID::new(1, 1);

/// Methods of OcaRoot
pub mod root {
    use super::*;

    pub const GET_CLASS_IDENTIFICATION: MethodID = MethodID::new(1, 1);
    pub const GET_LOCKABLE: MethodID = MethodID::new(1, 2);
    pub const LOCK_TOTAL: MethodID = MethodID::new(1, 3);
    pub const UNLOCK: MethodID = MethodID::new(1, 4);
    pub const GET_ROLE: MethodID = MethodID::new(1, 5);
    pub const LOCK_READ_ONLY: MethodID = MethodID::new(1, 6);
    pub const GET_LOCK_STATE: MethodID = MethodID::new(1, 7);

    pub const CLASS_ID_PROPERTY: PropertyID = PropertyID::new(1, 1);
    pub const CLASS_VERSION_PROPERTY: PropertyID = PropertyID::new(1, 2);
    pub const OBJECT_NUMBER_PROPERTY: PropertyID = PropertyID::new(1, 3);
    pub const LOCKABLE_PROPERTY: PropertyID = PropertyID::new(1, 4);
    pub const ROLE_PROPERTY: PropertyID = PropertyID::new(1, 5);
    pub const LOCK_STATE_PROPERTY: PropertyID = PropertyID::new(1, 6);
}

/// Methods, properties and events of OcaSubscriptionManager
pub mod subscription_manager {
    use super::*;

    pub const ADD_SUBSCRIPTION: MethodID = MethodID::new(3, 1);
    pub const REMOVE_SUBSCRIPTION: MethodID = MethodID::new(3, 2);
    pub const DISABLE_NOTIFICATIONS: MethodID = MethodID::new(3, 3);
    pub const REENABLE_NOTIFICATIONS: MethodID = MethodID::new(3, 4);
    pub const ADD_PROPERTY_CHANGE_SUBSCRIPTION: MethodID = MethodID::new(3, 5);
    pub const REMOVE_PROPERTY_CHANGE_SUBSCRIPTION: MethodID = MethodID::new(3, 6);
    pub const GET_MAXIMUM_SUBSCRIBER_CONTEXT_LENGTH: MethodID = MethodID::new(3, 7);
    pub const ADD_SUBSCRIPTION2: MethodID = MethodID::new(3, 8);
    pub const REMOVE_SUBSCRIPTION2: MethodID = MethodID::new(3, 9);
    pub const ADD_PROPERTY_CHANGE_SUBSCRIPTION2: MethodID = MethodID::new(3, 10);
    pub const REMOVE_PROPERTY_CHANGE_SUBSCRIPTION2: MethodID = MethodID::new(3, 11);

    pub const STATE_PROPERTY: PropertyID = PropertyID::new(3, 1);

    pub const NOTIFICATIONS_DISABLED_EVENT_ID: EventID = EventID::new(3, 1);
    pub const SYNCHRONIZE_STATE_EVENT_ID: EventID = EventID::new(3, 2);
}
