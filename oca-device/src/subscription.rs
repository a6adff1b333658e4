//! Subscription registry
//!
//! Subscriptions are stored per controller, keyed by the emitter object
//! number. EV1 and EV2 subscriptions are independent: a controller may hold
//! both for the same event.

use oca_core::params::{
    AddPropertyChangeSubscriptionParameters, AddSubscriptionParameters,
    PropertyChangeSubscription2Parameters, Subscription2Parameters, peek_property_id,
};
use oca_core::{
    Blob, Event, Method, NetworkAddress, NotificationDeliveryMode, ONo, OcaError, OcaResult,
    PropertyID, well_known::PROPERTY_CHANGED_EVENT_ID,
};
use oca_ocp1::{Message, Notification1, Notification2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Notification protocol version of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventVersion {
    Ev1 = 1,
    Ev2 = 2,
}

/// One subscription as requested through the subscription manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subscription {
    Event(AddSubscriptionParameters),
    PropertyChange(AddPropertyChangeSubscriptionParameters),
    Event2(Subscription2Parameters),
    PropertyChange2(PropertyChangeSubscription2Parameters),
}

impl Subscription {
    pub fn version(&self) -> EventVersion {
        match self {
            Self::Event(_) | Self::PropertyChange(_) => EventVersion::Ev1,
            Self::Event2(_) | Self::PropertyChange2(_) => EventVersion::Ev2,
        }
    }

    pub fn event(&self) -> Event {
        match self {
            Self::Event(s) => s.event,
            Self::Event2(s) => s.event,
            Self::PropertyChange(s) => Event::new(s.emitter, PROPERTY_CHANGED_EVENT_ID),
            Self::PropertyChange2(s) => Event::new(s.emitter, PROPERTY_CHANGED_EVENT_ID),
        }
    }

    /// Property filter of a property-change subscription
    pub fn property(&self) -> Option<PropertyID> {
        match self {
            Self::Event(_) | Self::Event2(_) => None,
            Self::PropertyChange(s) => Some(s.property),
            Self::PropertyChange2(s) => Some(s.property),
        }
    }

    /// Subscriber method; EV2 subscriptions have none
    pub fn subscriber(&self) -> Option<Method> {
        match self {
            Self::Event(s) => Some(s.subscriber),
            Self::PropertyChange(s) => Some(s.subscriber),
            Self::Event2(_) | Self::PropertyChange2(_) => None,
        }
    }

    pub fn subscriber_context(&self) -> Blob {
        match self {
            Self::Event(s) => s.subscriber_context.clone(),
            Self::PropertyChange(s) => s.subscriber_context.clone(),
            Self::Event2(_) | Self::PropertyChange2(_) => Blob::default(),
        }
    }

    pub fn delivery_mode(&self) -> NotificationDeliveryMode {
        match self {
            Self::Event(s) => s.notification_delivery_mode,
            Self::PropertyChange(s) => s.notification_delivery_mode,
            Self::Event2(s) => s.notification_delivery_mode,
            Self::PropertyChange2(s) => s.notification_delivery_mode,
        }
    }

    pub fn destination(&self) -> &NetworkAddress {
        match self {
            Self::Event(s) => &s.destination_information,
            Self::PropertyChange(s) => &s.destination_information,
            Self::Event2(s) => &s.destination_information,
            Self::PropertyChange2(s) => &s.destination_information,
        }
    }

    fn same_key(&self, other: &Subscription) -> bool {
        self.event() == other.event()
            && self.subscriber() == other.subscriber()
            && self.property() == other.property()
            && self.version() == other.version()
    }

    /// Build the notification delivering `event_data` for this subscription
    pub fn notification(&self, event_data: &[u8]) -> OcaResult<Message> {
        let event = self.event();
        match self.version() {
            EventVersion::Ev1 => {
                let subscriber = self.subscriber().ok_or(OcaError::NilNotEncodable)?;
                Ok(Message::Notification1(Notification1 {
                    target_ono: event.emitter_ono,
                    method_id: subscriber.method_id,
                    parameter_count: Notification1::EVENT_PARAMETER_COUNT,
                    context: self.subscriber_context(),
                    event,
                    event_data: event_data.to_vec(),
                }))
            }
            EventVersion::Ev2 => Ok(Message::Notification2(Notification2::event(
                event,
                event_data.to_vec(),
            ))),
        }
    }
}

/// One pending delivery produced by [`SubscriptionRegistry::notifications`]
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    /// Set for lightweight delivery
    pub destination: Option<NetworkAddress>,
}

/// Subscriptions of one controller
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<ONo, Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.subscriptions
            .get(&subscription.event().emitter_ono)
            .is_some_and(|list| list.iter().any(|s| s.same_key(subscription)))
    }

    /// Add a subscription
    ///
    /// # Errors
    /// `AlreadySubscribedToEvent` when an identical subscription exists
    pub fn add(&mut self, subscription: Subscription) -> OcaResult<()> {
        if self.contains(&subscription) {
            return Err(OcaError::AlreadySubscribedToEvent);
        }
        self.subscriptions
            .entry(subscription.event().emitter_ono)
            .or_default()
            .push(subscription);
        Ok(())
    }

    /// Remove the subscription matching `subscription`, if any
    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        let emitter = subscription.event().emitter_ono;
        let Some(list) = self.subscriptions.get_mut(&emitter) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| !s.same_key(subscription));
        let removed = list.len() != before;
        if list.is_empty() {
            self.subscriptions.remove(&emitter);
        }
        removed
    }

    /// Remove every EV1 subscription of `subscriber` to `event`
    ///
    /// With a `property`, only the property-change subscription for it goes.
    pub fn remove_matching(
        &mut self,
        event: Event,
        property: Option<PropertyID>,
        subscriber: Method,
    ) -> usize {
        let Some(list) = self.subscriptions.get_mut(&event.emitter_ono) else {
            return 0;
        };
        let before = list.len();
        list.retain(|s| {
            !(s.version() == EventVersion::Ev1
                && s.event() == event
                && s.subscriber() == Some(subscriber)
                && (property.is_none() || s.property() == property))
        });
        let removed = before - list.len();
        if list.is_empty() {
            self.subscriptions.remove(&event.emitter_ono);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Subscriptions matching an event
    ///
    /// For the property-changed event, property-change subscriptions match only
    /// the property named in the event data.
    pub fn matching(&self, event: Event, event_data: &[u8]) -> OcaResult<Vec<&Subscription>> {
        let Some(list) = self.subscriptions.get(&event.emitter_ono) else {
            return Ok(Vec::new());
        };
        let property = if event.event_id == PROPERTY_CHANGED_EVENT_ID {
            Some(peek_property_id(event_data)?)
        } else {
            None
        };
        Ok(list
            .iter()
            .filter(|s| s.event() == event)
            .filter(|s| s.property().is_none() || s.property() == property)
            .collect())
    }

    /// Notifications to send for an event
    pub fn notifications(&self, event: Event, event_data: &[u8]) -> OcaResult<Vec<Delivery>> {
        self.matching(event, event_data)?
            .into_iter()
            .map(|subscription| {
                let destination = match subscription.delivery_mode() {
                    NotificationDeliveryMode::Lightweight => {
                        Some(subscription.destination().clone())
                    }
                    NotificationDeliveryMode::Normal => None,
                };
                Ok(Delivery {
                    message: subscription.notification(event_data)?,
                    destination,
                })
            })
            .collect()
    }
}
