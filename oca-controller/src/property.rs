//! Remote properties
//!
//! A [`Property`] caches the last known value of one property of a remote
//! object in one of three states: not yet fetched, a value, or the error the
//! last fetch failed with. Reads go through [`Property::get_value`], which
//! consults the cache according to [`PropertyResolutionFlags`]; property-changed
//! events from the device update the cache as they arrive. Every state change
//! is published on a `watch` channel.

use async_trait::async_trait;
use bitflags::bitflags;
use oca_core::params::property_changed_event;
use oca_core::{
    Event, List2D, MethodID, ONo, OcaError, OcaResult, Ocp1Decoder, PropertyChangeType,
    PropertyID, WireDecode, WireEncode,
};
use oca_ocp1::Parameters;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

bitflags! {
    /// How [`Property::get_value`] uses and fills the cache
    ///
    /// # Flags
    ///
    /// - `RETURN_CACHED_VALUE`: answer from the cache when it holds a value
    /// - `CACHE_VALUE`: store a fetched value in the cache
    /// - `SUBSCRIBE_EVENTS`: subscribe to property-changed events of the object
    /// - `THROW_CACHED_ERROR`: answer from the cache when it holds any error
    /// - `CACHE_ERRORS`: store the error of a failed fetch in the cache
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PropertyResolutionFlags: u8 {
        const NONE = 0;
        const RETURN_CACHED_VALUE = 1 << 0;
        const CACHE_VALUE = 1 << 1;
        const SUBSCRIBE_EVENTS = 1 << 2;
        const THROW_CACHED_ERROR = 1 << 3;
        const CACHE_ERRORS = 1 << 4;

        const DEFAULT = Self::RETURN_CACHED_VALUE.bits()
            | Self::CACHE_VALUE.bits()
            | Self::SUBSCRIBE_EVENTS.bits()
            | Self::CACHE_ERRORS.bits();
    }
}

impl Default for PropertyResolutionFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Path from a property to its object on the device
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Call a method and wait for its response parameters
    async fn call(
        &self,
        target: ONo,
        method_id: MethodID,
        parameters: Parameters,
    ) -> OcaResult<Parameters>;

    /// Call a method without waiting for a response
    async fn send(&self, target: ONo, method_id: MethodID, parameters: Parameters)
    -> OcaResult<()>;

    async fn is_subscribed(&self, event: Event) -> bool;

    /// Start subscribing to the property-changed events of an object
    fn subscribe_in_background(&self, object_number: ONo);
}

/// Cached state of a property
#[derive(Debug, Default)]
pub enum PropertyValue<T> {
    #[default]
    Initial,
    Success(T),
    Failure(OcaError),
}

impl<T> PropertyValue<T> {
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&OcaError> {
        match self {
            Self::Failure(error) => Some(error),
            _ => None,
        }
    }
}

/// Properties whose items can change one at a time
///
/// Item events carry the index of the item followed by the item itself, or
/// the index alone when the item was deleted.
pub trait PropertyContainer {
    type Index: WireDecode;
    type Item: WireDecode;

    fn apply_item_change(
        &mut self,
        change_type: PropertyChangeType,
        index: Self::Index,
        item: Option<Self::Item>,
    ) -> OcaResult<()>;
}

fn missing_item() -> OcaError {
    OcaError::InvalidData("item event without item".to_string())
}

impl<T: WireDecode> PropertyContainer for Vec<T> {
    type Index = u16;
    type Item = T;

    fn apply_item_change(
        &mut self,
        change_type: PropertyChangeType,
        index: u16,
        item: Option<T>,
    ) -> OcaResult<()> {
        let index = usize::from(index);
        let out_of_range = || OcaError::InvalidData(format!("list index {} out of range", index));
        match change_type {
            PropertyChangeType::ItemAdded => {
                if index > self.len() {
                    return Err(out_of_range());
                }
                self.insert(index, item.ok_or_else(missing_item)?);
            }
            PropertyChangeType::ItemChanged => {
                let slot = self.get_mut(index).ok_or_else(out_of_range)?;
                *slot = item.ok_or_else(missing_item)?;
            }
            PropertyChangeType::ItemDeleted => {
                if index >= self.len() {
                    return Err(out_of_range());
                }
                self.remove(index);
            }
            _ => return Err(OcaError::UnhandledEvent),
        }
        Ok(())
    }
}

impl<K: WireDecode + Ord, V: WireDecode> PropertyContainer for BTreeMap<K, V> {
    type Index = K;
    type Item = V;

    fn apply_item_change(
        &mut self,
        change_type: PropertyChangeType,
        key: K,
        item: Option<V>,
    ) -> OcaResult<()> {
        match change_type {
            PropertyChangeType::ItemAdded | PropertyChangeType::ItemChanged => {
                self.insert(key, item.ok_or_else(missing_item)?);
            }
            PropertyChangeType::ItemDeleted => {
                self.remove(&key);
            }
            _ => return Err(OcaError::UnhandledEvent),
        }
        Ok(())
    }
}

impl<T: WireDecode> PropertyContainer for List2D<T> {
    type Index = (u16, u16);
    type Item = T;

    fn apply_item_change(
        &mut self,
        change_type: PropertyChangeType,
        (x, y): (u16, u16),
        item: Option<T>,
    ) -> OcaResult<()> {
        // the dimensions of a 2-D list are fixed
        if change_type != PropertyChangeType::ItemChanged {
            return Err(OcaError::UnhandledEvent);
        }
        let slot = self
            .get_mut(x, y)
            .ok_or_else(|| OcaError::InvalidData(format!("item ({}, {}) out of range", x, y)))?;
        *slot = item.ok_or_else(missing_item)?;
        Ok(())
    }
}

type ItemHandler<T> = fn(&mut T, PropertyChangeType, &mut Ocp1Decoder<'_>) -> OcaResult<()>;

fn apply_item_event<T: PropertyContainer>(
    value: &mut T,
    change_type: PropertyChangeType,
    decoder: &mut Ocp1Decoder<'_>,
) -> OcaResult<()> {
    let index: T::Index = decoder.decode()?;
    let item = if change_type == PropertyChangeType::ItemDeleted {
        None
    } else {
        Some(decoder.decode()?)
    };
    value.apply_item_change(change_type, index, item)
}

/// One property of a remote object
pub struct Property<T> {
    property_id: PropertyID,
    get_method: Option<MethodID>,
    set_method: Option<MethodID>,
    state: watch::Sender<PropertyValue<T>>,
    item_handler: Option<ItemHandler<T>>,
}

/// Resets the property to `Initial` if the request it guards is dropped
struct ResetOnDrop<'a, T> {
    state: &'a watch::Sender<PropertyValue<T>>,
    armed: bool,
}

impl<T> ResetOnDrop<'_, T> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T> Drop for ResetOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(PropertyValue::Initial);
        }
    }
}

impl<T> Property<T>
where
    T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
{
    pub fn new(
        property_id: PropertyID,
        get_method: Option<MethodID>,
        set_method: Option<MethodID>,
    ) -> Self {
        Self {
            property_id,
            get_method,
            set_method,
            state: watch::Sender::new(PropertyValue::Initial),
            item_handler: None,
        }
    }

    /// A list, map or 2-D list property accepting item change events
    pub fn container(
        property_id: PropertyID,
        get_method: Option<MethodID>,
        set_method: Option<MethodID>,
    ) -> Self
    where
        T: PropertyContainer,
    {
        Self {
            item_handler: Some(apply_item_event::<T>),
            ..Self::new(property_id, get_method, set_method)
        }
    }

    pub fn property_id(&self) -> PropertyID {
        self.property_id
    }

    pub fn get_method(&self) -> Option<MethodID> {
        self.get_method
    }

    pub fn set_method(&self) -> Option<MethodID> {
        self.set_method
    }

    /// The cached value, if any
    pub fn current(&self) -> Option<T> {
        self.state.borrow().value().cloned()
    }

    pub fn is_initial(&self) -> bool {
        self.state.borrow().is_initial()
    }

    /// Watch the cached state
    pub fn subscribe(&self) -> watch::Receiver<PropertyValue<T>> {
        self.state.subscribe()
    }

    /// Forget the cached state
    pub fn refresh(&self) {
        self.state.send_replace(PropertyValue::Initial);
    }

    fn publish(&self, value: PropertyValue<T>) {
        self.state.send_replace(value);
    }

    /// Cached answer to a read, if the flags allow one
    fn cached(&self, flags: PropertyResolutionFlags) -> Option<OcaResult<T>> {
        if !flags.contains(PropertyResolutionFlags::RETURN_CACHED_VALUE) {
            return None;
        }
        match &*self.state.borrow() {
            PropertyValue::Success(value) => Some(Ok(value.clone())),
            // a missing method stays missing for the life of the device
            PropertyValue::Failure(error)
                if flags.contains(PropertyResolutionFlags::THROW_CACHED_ERROR)
                    || error.status().is_permanent() =>
            {
                Some(Err(error.replay()))
            }
            _ => None,
        }
    }

    /// Read the property
    ///
    /// # Errors
    /// `PropertyIsSettableOnly` without a getter; `InvalidProxyMethodResponse`
    /// when the response does not hold a value of the property's type;
    /// otherwise the error of the get command or the cached error. A get
    /// that ends `Cancelled` leaves the cache `Initial`.
    pub async fn get_value(
        &self,
        channel: &dyn CommandChannel,
        object_number: ONo,
        flags: PropertyResolutionFlags,
    ) -> OcaResult<T> {
        let Some(get_method) = self.get_method else {
            return Err(OcaError::PropertyIsSettableOnly);
        };

        if flags.contains(PropertyResolutionFlags::SUBSCRIBE_EVENTS)
            && !channel
                .is_subscribed(property_changed_event(object_number))
                .await
        {
            channel.subscribe_in_background(object_number);
        }

        if let Some(cached) = self.cached(flags) {
            return cached;
        }

        let mut guard = ResetOnDrop {
            state: &self.state,
            armed: flags.contains(PropertyResolutionFlags::CACHE_ERRORS),
        };
        let result = match channel
            .call(object_number, get_method, Parameters::default())
            .await
        {
            Ok(parameters) => parameters.decode_result::<T>(1, "property get"),
            Err(e) => Err(e),
        };
        guard.disarm();

        match result {
            Ok(value) => {
                if flags.contains(PropertyResolutionFlags::CACHE_VALUE) {
                    self.publish(PropertyValue::Success(value.clone()));
                }
                Ok(value)
            }
            Err(OcaError::Cancelled) => {
                if flags.contains(PropertyResolutionFlags::CACHE_ERRORS) {
                    self.publish(PropertyValue::Initial);
                }
                Err(OcaError::Cancelled)
            }
            Err(e) => {
                log::debug!("get {} of {} failed: {}", self.property_id, object_number, e);
                if flags.contains(PropertyResolutionFlags::CACHE_ERRORS) {
                    self.publish(PropertyValue::Failure(e.replay()));
                }
                Err(e)
            }
        }
    }

    /// Write the property
    ///
    /// When the object's property-changed events are subscribed, the command
    /// is sent without waiting for a response and the cache follows the
    /// resulting event. Otherwise the cache takes the written value once the
    /// device accepts it.
    ///
    /// # Errors
    /// `PropertyIsImmutable` without a setter, or the error of the set command
    pub async fn set_value(
        &self,
        channel: &dyn CommandChannel,
        object_number: ONo,
        value: T,
    ) -> OcaResult<()> {
        let Some(set_method) = self.set_method else {
            return Err(OcaError::PropertyIsImmutable);
        };
        let parameters = Parameters::from_value(1, &value)?;

        if channel
            .is_subscribed(property_changed_event(object_number))
            .await
        {
            return channel.send(object_number, set_method, parameters).await;
        }

        let mut guard = ResetOnDrop {
            state: &self.state,
            armed: true,
        };
        let result = channel.call(object_number, set_method, parameters).await;
        guard.disarm();
        result?;
        self.publish(PropertyValue::Success(value));
        Ok(())
    }

    /// Apply property-changed event data to the cache
    ///
    /// # Errors
    /// `UnhandledEvent` for an event about another property, for min/max
    /// changes, and for item changes of a property that is not a container;
    /// `NoInitialValue` for an item change before the value was fetched.
    pub fn on_event(&self, event_data: &[u8]) -> OcaResult<()> {
        // the change type trails the value, whose length depends on the change type
        let Some((&change_byte, body)) = event_data.split_last() else {
            return Err(OcaError::BadFormat);
        };
        let change_type = PropertyChangeType::try_from(change_byte)?;
        let mut decoder = Ocp1Decoder::new(body);
        let property_id: PropertyID = decoder.decode()?;
        if property_id != self.property_id {
            return Err(OcaError::UnhandledEvent);
        }

        match change_type {
            PropertyChangeType::CurrentChanged => {
                let value: T = decoder.decode()?;
                self.publish(PropertyValue::Success(value));
                Ok(())
            }
            change_type if change_type.is_item_change() => {
                let Some(apply) = self.item_handler else {
                    return Err(OcaError::UnhandledEvent);
                };
                let Some(mut value) = self.current() else {
                    return Err(OcaError::NoInitialValue);
                };
                apply(&mut value, change_type, &mut decoder)?;
                self.publish(PropertyValue::Success(value));
                Ok(())
            }
            _ => Err(OcaError::UnhandledEvent),
        }
    }
}

impl<T> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("property_id", &self.property_id)
            .field("get_method", &self.get_method)
            .field("set_method", &self.set_method)
            .finish()
    }
}

/// A property of any value type, as held by a remote object
pub trait AnyProperty: Send + Sync {
    fn property_id(&self) -> PropertyID;

    fn on_event(&self, event_data: &[u8]) -> OcaResult<()>;

    fn refresh(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> AnyProperty for Property<T>
where
    T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
{
    fn property_id(&self) -> PropertyID {
        self.property_id
    }

    fn on_event(&self, event_data: &[u8]) -> OcaResult<()> {
        Property::on_event(self, event_data)
    }

    fn refresh(&self) {
        Property::refresh(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oca_core::params::PropertyChangedEventData;
    use oca_core::{OcaStatus, encode_value};
    use std::time::Duration;

    const GAIN: PropertyID = PropertyID::new(4, 1);
    const GET_GAIN: MethodID = MethodID::new(4, 1);
    const SET_GAIN: MethodID = MethodID::new(4, 2);

    fn gain() -> Property<f32> {
        Property::new(GAIN, Some(GET_GAIN), Some(SET_GAIN))
    }

    fn changed<T: WireEncode>(value: T, change_type: PropertyChangeType) -> Vec<u8> {
        encode_value(&PropertyChangedEventData {
            property_id: GAIN,
            property_value: value,
            change_type,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_cached_not_implemented_rethrown_without_traffic() {
        let mut channel = MockCommandChannel::new();
        channel.expect_is_subscribed().return_const(true);
        channel
            .expect_call()
            .times(1)
            .returning(|_, _, _| Err(OcaError::Status(OcaStatus::NotImplemented)));
        let property = gain();

        let first = property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(first, OcaError::Status(OcaStatus::NotImplemented)));

        let second = property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(second, OcaError::Status(OcaStatus::NotImplemented)));
    }

    #[tokio::test]
    async fn test_cached_transient_error_is_retried() {
        let mut channel = MockCommandChannel::new();
        channel.expect_is_subscribed().return_const(true);
        let mut calls = 0;
        channel.expect_call().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(OcaError::ResponseTimeout)
            } else {
                Parameters::from_value(1, &-3.0f32)
            }
        });
        let property = gain();

        assert!(property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .is_err());
        assert!(property.subscribe().borrow().error().is_some());
        let value = property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap();
        assert_eq!(value, -3.0);

        // with throwCachedError even a transient error comes from the cache
        let flags = PropertyResolutionFlags::DEFAULT | PropertyResolutionFlags::THROW_CACHED_ERROR;
        property.publish(PropertyValue::Failure(OcaError::ResponseTimeout));
        assert!(matches!(
            property.get_value(&channel, 4096, flags).await,
            Err(OcaError::ResponseTimeout)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_during_get_resets_to_initial() {
        let mut channel = MockCommandChannel::new();
        channel.expect_is_subscribed().return_const(true);
        channel
            .expect_call()
            .times(1)
            .returning(|_, _, _| Err(OcaError::Cancelled));
        let property = gain();
        property.publish(PropertyValue::Failure(OcaError::ResponseTimeout));

        let err = property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(err, OcaError::Cancelled));
        assert!(property.is_initial());
    }

    #[tokio::test]
    async fn test_undecodable_get_response() {
        let mut channel = MockCommandChannel::new();
        channel.expect_is_subscribed().return_const(true);
        // a u8 where an f32 is expected, under a wrong parameter count
        channel
            .expect_call()
            .times(1)
            .returning(|_, _, _| Ok(Parameters::new(2, vec![7])));
        let property = gain();

        let err = property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(err, OcaError::InvalidProxyMethodResponse));
        assert!(matches!(
            property.subscribe().borrow().error(),
            Some(OcaError::InvalidProxyMethodResponse)
        ));
    }

    #[tokio::test]
    async fn test_get_value_caches_and_subscribes() {
        let mut channel = MockCommandChannel::new();
        channel
            .expect_is_subscribed()
            .withf(|event| *event == property_changed_event(4096))
            .return_const(false);
        channel
            .expect_subscribe_in_background()
            .withf(|ono| *ono == 4096)
            .times(2)
            .return_const(());
        channel
            .expect_call()
            .withf(|target, method, params| {
                *target == 4096 && *method == GET_GAIN && params.is_empty()
            })
            .times(1)
            .returning(|_, _, _| Parameters::from_value(1, &-6.0f32));
        let property = gain();
        let mut watcher = property.subscribe();

        let value = property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap();
        assert_eq!(value, -6.0);
        assert!(watcher.has_changed().unwrap());
        assert_eq!(watcher.borrow_and_update().value(), Some(&-6.0));

        // answered from the cache
        let value = property
            .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
            .await
            .unwrap();
        assert_eq!(value, -6.0);
    }

    #[tokio::test]
    async fn test_get_without_cache_flags() {
        let mut channel = MockCommandChannel::new();
        channel
            .expect_call()
            .times(2)
            .returning(|_, _, _| Parameters::from_value(1, &1.0f32));
        let property = gain();
        let flags = PropertyResolutionFlags::NONE;
        property.get_value(&channel, 4096, flags).await.unwrap();
        property.get_value(&channel, 4096, flags).await.unwrap();
        assert!(property.is_initial());
    }

    struct Stalled;

    #[async_trait]
    impl CommandChannel for Stalled {
        async fn call(&self, _: ONo, _: MethodID, _: Parameters) -> OcaResult<Parameters> {
            std::future::pending().await
        }

        async fn send(&self, _: ONo, _: MethodID, _: Parameters) -> OcaResult<()> {
            std::future::pending().await
        }

        async fn is_subscribed(&self, _: Event) -> bool {
            false
        }

        fn subscribe_in_background(&self, _: ONo) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_get_resets_to_initial() {
        let property = gain();
        property.publish(PropertyValue::Failure(OcaError::ResponseTimeout));
        let flags = PropertyResolutionFlags::DEFAULT.difference(PropertyResolutionFlags::SUBSCRIBE_EVENTS);
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            property.get_value(&Stalled, 4096, flags),
        )
        .await;
        assert!(result.is_err());
        assert!(property.is_initial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_set_resets_to_initial() {
        let property = gain();
        property.publish(PropertyValue::Success(2.0));
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            property.set_value(&Stalled, 4096, 5.0),
        )
        .await;
        assert!(result.is_err());
        assert!(property.current().is_none());
        assert!(property.is_initial());
    }

    #[tokio::test]
    async fn test_set_value_paths() {
        // unsubscribed: call and take the written value
        let mut channel = MockCommandChannel::new();
        channel.expect_is_subscribed().return_const(false);
        channel
            .expect_call()
            .withf(|_, method, params| {
                *method == SET_GAIN && params.decode::<f32>().unwrap() == 4.5
            })
            .times(1)
            .returning(|_, _, _| Ok(Parameters::default()));
        let property = gain();
        property.set_value(&channel, 4096, 4.5).await.unwrap();
        assert_eq!(property.current(), Some(4.5));

        // subscribed: fire and forget, the event updates the cache
        let mut channel = MockCommandChannel::new();
        channel.expect_is_subscribed().return_const(true);
        channel.expect_send().times(1).returning(|_, _, _| Ok(()));
        property.set_value(&channel, 4096, 7.0).await.unwrap();
        assert_eq!(property.current(), Some(4.5));
        property
            .on_event(&changed(7.0f32, PropertyChangeType::CurrentChanged))
            .unwrap();
        assert_eq!(property.current(), Some(7.0));
    }

    #[tokio::test]
    async fn test_failed_set_keeps_cache() {
        let mut channel = MockCommandChannel::new();
        channel.expect_is_subscribed().return_const(false);
        channel
            .expect_call()
            .returning(|_, _, _| Err(OcaError::Status(OcaStatus::Locked)));
        let property = gain();
        property.publish(PropertyValue::Success(1.0));
        let err = property.set_value(&channel, 4096, 2.0).await.unwrap_err();
        assert!(matches!(err, OcaError::Status(OcaStatus::Locked)));
        assert_eq!(property.current(), Some(1.0));
    }

    #[tokio::test]
    async fn test_missing_methods() {
        let channel = MockCommandChannel::new();
        let read_only: Property<f32> = Property::new(GAIN, Some(GET_GAIN), None);
        assert!(matches!(
            read_only.set_value(&channel, 4096, 1.0).await,
            Err(OcaError::PropertyIsImmutable)
        ));
        let write_only: Property<f32> = Property::new(GAIN, None, Some(SET_GAIN));
        assert!(matches!(
            write_only
                .get_value(&channel, 4096, PropertyResolutionFlags::DEFAULT)
                .await,
            Err(OcaError::PropertyIsSettableOnly)
        ));
    }

    #[test]
    fn test_scalar_event_handling() {
        let property = gain();
        assert!(matches!(
            property.on_event(&changed(1.0f32, PropertyChangeType::MinChanged)),
            Err(OcaError::UnhandledEvent)
        ));
        assert!(matches!(
            property.on_event(&changed((0u16, 1.0f32), PropertyChangeType::ItemChanged)),
            Err(OcaError::UnhandledEvent)
        ));
        assert!(matches!(property.on_event(&[]), Err(OcaError::BadFormat)));

        let other = encode_value(&PropertyChangedEventData {
            property_id: PropertyID::new(4, 2),
            property_value: 1.0f32,
            change_type: PropertyChangeType::CurrentChanged,
        })
        .unwrap();
        assert!(matches!(property.on_event(&other), Err(OcaError::UnhandledEvent)));
        assert!(property.is_initial());
    }

    #[test]
    fn test_list_item_events() {
        let property: Property<Vec<u32>> = Property::container(GAIN, Some(GET_GAIN), None);
        assert!(matches!(
            property.on_event(&changed((0u16, 5u32), PropertyChangeType::ItemAdded)),
            Err(OcaError::NoInitialValue)
        ));

        property
            .on_event(&changed(vec![1u32, 2, 3], PropertyChangeType::CurrentChanged))
            .unwrap();
        property
            .on_event(&changed((1u16, 9u32), PropertyChangeType::ItemAdded))
            .unwrap();
        assert_eq!(property.current(), Some(vec![1, 9, 2, 3]));
        property
            .on_event(&changed((3u16, 4u32), PropertyChangeType::ItemChanged))
            .unwrap();
        assert_eq!(property.current(), Some(vec![1, 9, 2, 4]));
        property
            .on_event(&changed(0u16, PropertyChangeType::ItemDeleted))
            .unwrap();
        assert_eq!(property.current(), Some(vec![9, 2, 4]));
        assert!(property
            .on_event(&changed(7u16, PropertyChangeType::ItemDeleted))
            .is_err());
    }

    #[test]
    fn test_map_and_2d_item_events() {
        let map: Property<BTreeMap<u16, String>> = Property::container(GAIN, Some(GET_GAIN), None);
        map.on_event(&changed(BTreeMap::<u16, String>::new(), PropertyChangeType::CurrentChanged))
            .unwrap();
        map.on_event(&changed((3u16, "left".to_string()), PropertyChangeType::ItemAdded))
            .unwrap();
        map.on_event(&changed((4u16, "right".to_string()), PropertyChangeType::ItemAdded))
            .unwrap();
        map.on_event(&changed(3u16, PropertyChangeType::ItemDeleted))
            .unwrap();
        let current = map.current().unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current.get(&4).map(String::as_str), Some("right"));

        let grid: Property<List2D<u8>> = Property::container(GAIN, Some(GET_GAIN), None);
        let initial = List2D {
            nx: 2,
            ny: 2,
            items: vec![0u8, 0, 0, 0],
        };
        grid.on_event(&changed(initial, PropertyChangeType::CurrentChanged))
            .unwrap();
        grid.on_event(&changed(((1u16, 0u16), 7u8), PropertyChangeType::ItemChanged))
            .unwrap();
        assert_eq!(grid.current().unwrap().get(1, 0), Some(&7));
        assert!(matches!(
            grid.on_event(&changed(((0u16, 0u16), 1u8), PropertyChangeType::ItemAdded)),
            Err(OcaError::UnhandledEvent)
        ));
    }

    #[test]
    fn test_flags() {
        let flags = PropertyResolutionFlags::default();
        assert!(flags.contains(PropertyResolutionFlags::RETURN_CACHED_VALUE));
        assert!(flags.contains(PropertyResolutionFlags::CACHE_ERRORS));
        assert!(!flags.contains(PropertyResolutionFlags::THROW_CACHED_ERROR));
        let flags = flags.difference(PropertyResolutionFlags::SUBSCRIBE_EVENTS);
        assert!(!flags.contains(PropertyResolutionFlags::SUBSCRIBE_EVENTS));
        assert!(flags.contains(PropertyResolutionFlags::NONE));
    }
}
