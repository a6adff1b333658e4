//! OCA device runtime
//!
//! Serves device objects to controllers: commands are dispatched by object
//! number, objects may be locked by one controller at a time, and events are
//! fanned out to the controllers subscribed to them.

pub mod controller;
pub mod device;
pub mod listener;
pub mod lock;
pub mod object;
pub mod property;
pub mod subscription;
pub mod subscription_manager;

pub use controller::{Controller, MISSED_HEARTBEAT_LIMIT, StreamController};
pub use device::{Device, DeviceConfig};
pub use listener::DeviceListener;
pub use lock::{ControllerId, LockState};
pub use object::{
    CommandContext, DeviceObject, ObjectBase, decode_command, decode_null_command,
    encode_response,
};
pub use property::{DeviceProperty, ValueObject};
pub use subscription::{Delivery, EventVersion, Subscription, SubscriptionRegistry};
pub use subscription_manager::SubscriptionManager;
