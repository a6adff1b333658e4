//! Parameter and event-data structures shared by controller and device
//!
//! These are the payloads of subscription manager methods and of the
//! standard events. Both sides encode them with [`WireEncode`] and decode them
//! with [`WireDecode`].

use crate::error::OcaResult;
use crate::types::*;
use crate::well_known::PROPERTY_CHANGED_EVENT_ID;
use crate::wire::{Ocp1Decoder, Ocp1Encoder, WireDecode, WireEncode};
use serde::{Deserialize, Serialize};

/// Implements the wire traits for a struct by encoding its fields in order
macro_rules! wire_struct {
    ($name:ident { $($field:ident),* $(,)? }) => {
        impl WireEncode for $name {
            fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
                $( self.$field.encode(encoder)?; )*
                Ok(())
            }
        }

        impl WireDecode for $name {
            fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
                Ok(Self { $( $field: decoder.decode()?, )* })
            }
        }
    };
}

/// Subscription manager state (property 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubscriptionManagerState {
    Normal = 1,
    EventsDisabled = 2,
}

impl TryFrom<u8> for SubscriptionManagerState {
    type Error = crate::OcaError;

    fn try_from(value: u8) -> OcaResult<Self> {
        match value {
            1 => Ok(Self::Normal),
            2 => Ok(Self::EventsDisabled),
            _ => Err(crate::OcaError::BadFormat),
        }
    }
}

impl WireEncode for SubscriptionManagerState {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_u8(*self as u8);
        Ok(())
    }
}

impl WireDecode for SubscriptionManagerState {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Self::try_from(decoder.get_u8()?)
    }
}

/// EV1 subscription (addSubscription, 3.1)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddSubscriptionParameters {
    pub event: Event,
    pub subscriber: Method,
    pub subscriber_context: Blob,
    pub notification_delivery_mode: NotificationDeliveryMode,
    pub destination_information: NetworkAddress,
}

wire_struct!(AddSubscriptionParameters {
    event,
    subscriber,
    subscriber_context,
    notification_delivery_mode,
    destination_information,
});

/// removeSubscription (3.2)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoveSubscriptionParameters {
    pub event: Event,
    pub subscriber: Method,
}

wire_struct!(RemoveSubscriptionParameters { event, subscriber });

/// EV1 property-change subscription (addPropertyChangeSubscription, 3.5)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddPropertyChangeSubscriptionParameters {
    pub emitter: ONo,
    pub property: PropertyID,
    pub subscriber: Method,
    pub subscriber_context: Blob,
    pub notification_delivery_mode: NotificationDeliveryMode,
    pub destination_information: NetworkAddress,
}

wire_struct!(AddPropertyChangeSubscriptionParameters {
    emitter,
    property,
    subscriber,
    subscriber_context,
    notification_delivery_mode,
    destination_information,
});

/// removePropertyChangeSubscription (3.6)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemovePropertyChangeSubscriptionParameters {
    pub emitter: ONo,
    pub property: PropertyID,
    pub subscriber: Method,
}

wire_struct!(RemovePropertyChangeSubscriptionParameters {
    emitter,
    property,
    subscriber,
});

/// EV2 subscription (3.8 add, 3.9 remove)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription2Parameters {
    pub event: Event,
    pub notification_delivery_mode: NotificationDeliveryMode,
    pub destination_information: NetworkAddress,
}

wire_struct!(Subscription2Parameters {
    event,
    notification_delivery_mode,
    destination_information,
});

/// EV2 property-change subscription (3.10 add, 3.11 remove)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyChangeSubscription2Parameters {
    pub emitter: ONo,
    pub property: PropertyID,
    pub notification_delivery_mode: NotificationDeliveryMode,
    pub destination_information: NetworkAddress,
}

wire_struct!(PropertyChangeSubscription2Parameters {
    emitter,
    property,
    notification_delivery_mode,
    destination_information,
});

/// Destination of lightweight notifications, carried inside a `NetworkAddress` blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ocp1NetworkAddress {
    pub address: String,
    pub port: u16,
}

wire_struct!(Ocp1NetworkAddress { address, port });

impl Ocp1NetworkAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn from_network_address(network_address: &NetworkAddress) -> OcaResult<Self> {
        crate::wire::decode_value(network_address.as_bytes())
    }

    pub fn to_network_address(&self) -> OcaResult<NetworkAddress> {
        Ok(Blob(crate::wire::encode_value(self)?))
    }

    /// Resolve to a socket address; the address must be a numeric IP
    pub fn socket_address(&self) -> OcaResult<std::net::SocketAddr> {
        let ip: std::net::IpAddr = self
            .address
            .parse()
            .map_err(|_| crate::OcaError::InvalidData(format!("invalid address {}", self.address)))?;
        Ok(std::net::SocketAddr::new(ip, self.port))
    }
}

/// Payload of the synchronize-state event: ONos changed while events were disabled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectListEventData {
    pub object_list: Vec<ONo>,
}

wire_struct!(ObjectListEventData { object_list });

/// Payload of the generic property-changed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChangedEventData<T> {
    pub property_id: PropertyID,
    pub property_value: T,
    pub change_type: PropertyChangeType,
}

impl<T: WireEncode> WireEncode for PropertyChangedEventData<T> {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        self.property_id.encode(encoder)?;
        self.property_value.encode(encoder)?;
        self.change_type.encode(encoder)
    }
}

impl<T: WireDecode> WireDecode for PropertyChangedEventData<T> {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(Self {
            property_id: decoder.decode()?,
            property_value: decoder.decode()?,
            change_type: decoder.decode()?,
        })
    }
}

/// The property-changed event raised by `emitter`
#[must_use]
pub fn property_changed_event(emitter: ONo) -> Event {
    Event::new(emitter, PROPERTY_CHANGED_EVENT_ID)
}

/// Read the property ID from the first four bytes of property-changed event data
pub fn peek_property_id(event_data: &[u8]) -> OcaResult<PropertyID> {
    Ocp1Decoder::new(event_data).decode()
}
