//! Remote object proxies
//!
//! A [`RemoteObject`] stands for one object on the device: its object number,
//! the class identification the device reported, and the properties the
//! proxy's class knows about. Proxies are built by the factories of the
//! connection's class registry and kept in its object cache.

use crate::connection::{Connection, EventCallback, SubscriptionToken};
use crate::property::{AnyProperty, CommandChannel, Property, PropertyResolutionFlags};
use oca_core::params::{peek_property_id, property_changed_event};
use oca_core::well_known::root;
use oca_core::{
    ClassIdentification, Event, LockStatus, ONo, OcaError, OcaResult, PropertyID, WireDecode, WireEncode,
};
use oca_ocp1::Parameters;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Builds the proxy of a class for an object number and the identification
/// the device reported
pub type ObjectFactory = Arc<dyn Fn(ONo, ClassIdentification) -> RemoteObject + Send + Sync>;

/// Controller-side proxy of a device object
pub struct RemoteObject {
    object_number: ONo,
    class_identification: ClassIdentification,
    properties: HashMap<PropertyID, Arc<dyn AnyProperty>>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

impl RemoteObject {
    /// A proxy with the properties every object has: role and lockable
    pub fn new(object_number: ONo, class_identification: ClassIdentification) -> Self {
        Self {
            object_number,
            class_identification,
            properties: HashMap::new(),
            subscription: Mutex::new(None),
        }
        .with_property(Property::<String>::new(
            root::ROLE_PROPERTY,
            Some(root::GET_ROLE),
            None,
        ))
        .with_property(Property::<bool>::new(
            root::LOCKABLE_PROPERTY,
            Some(root::GET_LOCKABLE),
            None,
        ))
    }

    /// Add a property, replacing any with the same ID
    pub fn with_property<T>(mut self, property: Property<T>) -> Self
    where
        T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
    {
        self.properties
            .insert(property.property_id(), Arc::new(property));
        self
    }

    pub fn object_number(&self) -> ONo {
        self.object_number
    }

    pub fn class_identification(&self) -> &ClassIdentification {
        &self.class_identification
    }

    pub fn property_ids(&self) -> Vec<PropertyID> {
        let mut ids: Vec<PropertyID> = self.properties.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The property with `id`, if it holds values of type `T`
    pub fn property<T>(&self, id: PropertyID) -> Option<Arc<Property<T>>>
    where
        T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
    {
        self.properties
            .get(&id)?
            .clone()
            .as_any()
            .downcast::<Property<T>>()
            .ok()
    }

    fn typed_property<T>(&self, id: PropertyID) -> OcaResult<Arc<Property<T>>>
    where
        T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
    {
        self.property(id).ok_or_else(|| {
            OcaError::InvalidData(format!(
                "object {} has no property {} of the requested type",
                self.object_number, id
            ))
        })
    }

    pub async fn get_value<T>(
        &self,
        channel: &dyn CommandChannel,
        id: PropertyID,
        flags: PropertyResolutionFlags,
    ) -> OcaResult<T>
    where
        T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
    {
        self.typed_property::<T>(id)?
            .get_value(channel, self.object_number, flags)
            .await
    }

    pub async fn set_value<T>(
        &self,
        channel: &dyn CommandChannel,
        id: PropertyID,
        value: T,
    ) -> OcaResult<()>
    where
        T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
    {
        self.typed_property::<T>(id)?
            .set_value(channel, self.object_number, value)
            .await
    }

    /// Route property-changed event data to the property it names
    pub fn on_event(&self, event_data: &[u8]) -> OcaResult<()> {
        let id = peek_property_id(event_data)?;
        match self.properties.get(&id) {
            Some(property) => property.on_event(event_data),
            None => {
                log::trace!("object {} ignores change of property {}", self.object_number, id);
                Ok(())
            }
        }
    }

    /// Forget every cached property value
    pub fn refresh(&self) {
        for property in self.properties.values() {
            property.refresh();
        }
    }

    /// Subscribe to the object's property-changed events
    ///
    /// Does nothing when already subscribed on `connection`.
    pub async fn subscribe(self: &Arc<Self>, connection: &Connection) -> OcaResult<()> {
        let mut subscription = self.subscription.lock().await;
        if let Some(token) = subscription.as_ref() {
            if connection.has_subscription(token).await {
                return Ok(());
            }
        }

        let weak = Arc::downgrade(self);
        let callback: EventCallback = Arc::new(move |event: Event, result: Result<&[u8], &OcaError>| {
            let Some(object) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(data) => {
                    if let Err(e) = object.on_event(data) {
                        log::debug!("event {} not applied: {}", event, e);
                    }
                }
                Err(e) => log::warn!("object {}: {}", object.object_number, e),
            }
        });
        let token = connection
            .add_subscription(property_changed_event(self.object_number), callback)
            .await?;
        *subscription = Some(token);
        Ok(())
    }

    pub async fn unsubscribe(&self, connection: &Connection) -> OcaResult<()> {
        let Some(token) = self.subscription.lock().await.take() else {
            return Err(OcaError::NotSubscribedToEvent);
        };
        connection.remove_subscription(&token).await
    }

    /// Fetch the class identification from the device
    pub async fn get_class_identification(
        &self,
        channel: &dyn CommandChannel,
    ) -> OcaResult<ClassIdentification> {
        channel
            .call(
                self.object_number,
                root::GET_CLASS_IDENTIFICATION,
                Parameters::default(),
            )
            .await?
            .decode_result(1, "class identification")
    }

    /// Lock the object against reads and writes by other controllers
    pub async fn lock(&self, channel: &dyn CommandChannel) -> OcaResult<()> {
        self.call_without_result(channel, root::LOCK_TOTAL).await
    }

    /// Lock the object against writes by other controllers
    pub async fn lock_read_only(&self, channel: &dyn CommandChannel) -> OcaResult<()> {
        self.call_without_result(channel, root::LOCK_READ_ONLY).await
    }

    pub async fn unlock(&self, channel: &dyn CommandChannel) -> OcaResult<()> {
        self.call_without_result(channel, root::UNLOCK).await
    }

    pub async fn get_lock_state(&self, channel: &dyn CommandChannel) -> OcaResult<LockStatus> {
        channel
            .call(self.object_number, root::GET_LOCK_STATE, Parameters::default())
            .await?
            .decode_result(1, "lock state")
    }

    async fn call_without_result(
        &self,
        channel: &dyn CommandChannel,
        method_id: oca_core::MethodID,
    ) -> OcaResult<()> {
        channel
            .call(self.object_number, method_id, Parameters::default())
            .await
            .map(|_| ())
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("object_number", &self.object_number)
            .field("class_identification", &self.class_identification)
            .field("properties", &self.property_ids())
            .finish()
    }
}

impl fmt::Display for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.object_number, self.class_identification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::MockCommandChannel;
    use oca_core::params::PropertyChangedEventData;
    use oca_core::{MethodID, OcaStatus, PropertyChangeType, encode_value};

    const LEVEL: PropertyID = PropertyID::new(4, 1);

    fn object() -> RemoteObject {
        RemoteObject::new(4096, ClassIdentification::new("1.1.1.5".parse().unwrap(), 2))
            .with_property(Property::<f32>::new(
                LEVEL,
                Some(MethodID::new(4, 1)),
                Some(MethodID::new(4, 2)),
            ))
    }

    #[test]
    fn test_typed_property_lookup() {
        let object = object();
        assert!(object.property::<f32>(LEVEL).is_some());
        assert!(object.property::<u32>(LEVEL).is_none());
        assert!(object.property::<String>(root::ROLE_PROPERTY).is_some());
        assert_eq!(
            object.property_ids(),
            vec![root::LOCKABLE_PROPERTY, root::ROLE_PROPERTY, LEVEL]
        );
    }

    #[test]
    fn test_event_routing_and_refresh() {
        let object = object();
        let data = encode_value(&PropertyChangedEventData {
            property_id: LEVEL,
            property_value: 2.5f32,
            change_type: PropertyChangeType::CurrentChanged,
        })
        .unwrap();
        object.on_event(&data).unwrap();
        assert_eq!(object.property::<f32>(LEVEL).unwrap().current(), Some(2.5));

        // unknown properties are ignored
        let other = encode_value(&PropertyChangedEventData {
            property_id: PropertyID::new(9, 9),
            property_value: 1u8,
            change_type: PropertyChangeType::CurrentChanged,
        })
        .unwrap();
        object.on_event(&other).unwrap();

        object.refresh();
        assert!(object.property::<f32>(LEVEL).unwrap().is_initial());
    }

    #[tokio::test]
    async fn test_root_methods() {
        let mut channel = MockCommandChannel::new();
        channel
            .expect_call()
            .withf(|ono, method, _| *ono == 4096 && *method == root::GET_CLASS_IDENTIFICATION)
            .returning(|_, _, _| {
                Parameters::from_value(
                    2,
                    &ClassIdentification::new("1.1.1.5".parse().unwrap(), 2),
                )
            });
        channel
            .expect_call()
            .withf(|_, method, _| *method == root::LOCK_TOTAL)
            .times(1)
            .returning(|_, _, _| Err(OcaError::Status(OcaStatus::Locked)));
        channel
            .expect_call()
            .withf(|_, method, _| *method == root::GET_LOCK_STATE)
            .returning(|_, _, _| Parameters::from_value(1, &LockStatus::NoLock));

        let object = object();
        let identification = object.get_class_identification(&channel).await.unwrap();
        assert_eq!(identification.class_version, 2);
        assert!(matches!(
            object.lock(&channel).await,
            Err(OcaError::Status(OcaStatus::Locked))
        ));
        assert_eq!(object.get_lock_state(&channel).await.unwrap(), LockStatus::NoLock);
    }

    #[tokio::test]
    async fn test_wrong_property_type() {
        let channel = MockCommandChannel::new();
        let err = object()
            .get_value::<u32>(&channel, LEVEL, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(err, OcaError::InvalidData(_)));
    }
}
