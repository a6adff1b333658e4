//! The subscription manager object (ONo 4)
//!
//! Controllers add and remove their subscriptions through this object. It can
//! also suspend event delivery device-wide: while disabled, the emitters of
//! suppressed events are collected, and re-enabling sends one synchronize-state
//! event listing them.

use crate::device::Device;
use crate::object::{
    CommandContext, DeviceObject, ObjectBase, decode_command, decode_null_command,
    encode_response,
};
use crate::subscription::Subscription;
use async_trait::async_trait;
use oca_core::params::{
    AddPropertyChangeSubscriptionParameters, AddSubscriptionParameters, ObjectListEventData,
    PropertyChangeSubscription2Parameters, RemovePropertyChangeSubscriptionParameters,
    RemoveSubscriptionParameters, Subscription2Parameters, SubscriptionManagerState,
    property_changed_event,
};
use oca_core::well_known::{SUBSCRIPTION_MANAGER_ONO, subscription_manager as methods};
use oca_core::{
    ClassID, ClassIdentification, Event, NotificationDeliveryMode, ONo, OcaError, OcaResult,
    OcaStatus, encode_value,
};
use oca_ocp1::{Command, Parameters};
use std::collections::BTreeSet;
use tokio::sync::Mutex;

pub const CLASS_VERSION: u16 = 2;

pub fn class_id() -> ClassID {
    ClassID::new(vec![1, 3, 4])
}

#[derive(Debug)]
struct ManagerState {
    state: SubscriptionManagerState,
    changed: BTreeSet<ONo>,
}

pub struct SubscriptionManager {
    base: ObjectBase,
    state: Mutex<ManagerState>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            base: ObjectBase::new(
                SUBSCRIPTION_MANAGER_ONO,
                ClassIdentification::new(class_id(), CLASS_VERSION),
            )
            .with_role("Subscription Manager"),
            state: Mutex::new(ManagerState {
                state: SubscriptionManagerState::Normal,
                changed: BTreeSet::new(),
            }),
        }
    }

    pub async fn state(&self) -> SubscriptionManagerState {
        self.state.lock().await.state
    }

    /// Record `emitter` instead of delivering its event while disabled
    ///
    /// Returns true when the event must not be delivered now.
    pub(crate) async fn suppress(&self, emitter: ONo) -> bool {
        let mut state = self.state.lock().await;
        if state.state == SubscriptionManagerState::EventsDisabled {
            state.changed.insert(emitter);
            true
        } else {
            false
        }
    }

    /// Announce the suspension, then stop delivering events
    pub async fn disable_notifications(&self, device: &Device) -> OcaResult<()> {
        let event = Event::new(SUBSCRIPTION_MANAGER_ONO, methods::NOTIFICATIONS_DISABLED_EVENT_ID);
        device.deliver(event, &[]).await;
        let mut state = self.state.lock().await;
        state.state = SubscriptionManagerState::EventsDisabled;
        log::info!("notifications disabled");
        Ok(())
    }

    /// Resume delivery and send one synchronize-state event for the objects
    /// that changed meanwhile
    pub async fn reenable_notifications(&self, device: &Device) -> OcaResult<()> {
        let object_list: Vec<ONo> = {
            let mut state = self.state.lock().await;
            if state.state == SubscriptionManagerState::Normal {
                return Ok(());
            }
            state.state = SubscriptionManagerState::Normal;
            std::mem::take(&mut state.changed).into_iter().collect()
        };
        log::info!(
            "notifications re-enabled, {} objects changed meanwhile",
            object_list.len()
        );
        let data = encode_value(&ObjectListEventData { object_list })?;
        let event = Event::new(SUBSCRIPTION_MANAGER_ONO, methods::SYNCHRONIZE_STATE_EVENT_ID);
        device.deliver(event, &data).await;
        Ok(())
    }

    async fn add_subscription(
        &self,
        subscription: Subscription,
        context: &CommandContext,
    ) -> OcaResult<Parameters> {
        if subscription.delivery_mode() == NotificationDeliveryMode::Lightweight
            && !context.controller.supports_lightweight()
        {
            return Err(OcaError::Status(OcaStatus::ParameterError));
        }
        context.controller.add_subscription(subscription).await?;
        Ok(Parameters::default())
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceObject for SubscriptionManager {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    async fn handle_command(
        &self,
        command: &Command,
        context: &CommandContext,
    ) -> OcaResult<Parameters> {
        let method = command.method_id;
        if method.def_level != 3 {
            return self.base.handle_command(command, context).await;
        }
        self.base.ensure_writable(context.controller_id()).await?;
        let controller = &context.controller;

        match method {
            methods::ADD_SUBSCRIPTION => {
                let params: AddSubscriptionParameters = decode_command(command, 5)?;
                self.add_subscription(Subscription::Event(params), context).await
            }
            methods::REMOVE_SUBSCRIPTION => {
                let params: RemoveSubscriptionParameters = decode_command(command, 2)?;
                controller
                    .remove_matching_subscriptions(params.event, None, params.subscriber)
                    .await?;
                Ok(Parameters::default())
            }
            methods::DISABLE_NOTIFICATIONS => {
                decode_null_command(command)?;
                self.disable_notifications(&context.device).await?;
                Ok(Parameters::default())
            }
            methods::REENABLE_NOTIFICATIONS => {
                decode_null_command(command)?;
                self.reenable_notifications(&context.device).await?;
                Ok(Parameters::default())
            }
            methods::ADD_PROPERTY_CHANGE_SUBSCRIPTION => {
                let params: AddPropertyChangeSubscriptionParameters = decode_command(command, 6)?;
                self.add_subscription(Subscription::PropertyChange(params), context).await
            }
            methods::REMOVE_PROPERTY_CHANGE_SUBSCRIPTION => {
                let params: RemovePropertyChangeSubscriptionParameters =
                    decode_command(command, 3)?;
                controller
                    .remove_matching_subscriptions(
                        property_changed_event(params.emitter),
                        Some(params.property),
                        params.subscriber,
                    )
                    .await?;
                Ok(Parameters::default())
            }
            methods::GET_MAXIMUM_SUBSCRIBER_CONTEXT_LENGTH => {
                decode_null_command(command)?;
                encode_response(&context.device.config().max_subscriber_context_length)
            }
            methods::ADD_SUBSCRIPTION2 => {
                let params: Subscription2Parameters = decode_command(command, 3)?;
                self.add_subscription(Subscription::Event2(params), context).await
            }
            methods::REMOVE_SUBSCRIPTION2 => {
                let params: Subscription2Parameters = decode_command(command, 3)?;
                controller
                    .remove_subscription(&Subscription::Event2(params))
                    .await?;
                Ok(Parameters::default())
            }
            methods::ADD_PROPERTY_CHANGE_SUBSCRIPTION2 => {
                let params: PropertyChangeSubscription2Parameters = decode_command(command, 4)?;
                self.add_subscription(Subscription::PropertyChange2(params), context).await
            }
            methods::REMOVE_PROPERTY_CHANGE_SUBSCRIPTION2 => {
                let params: PropertyChangeSubscription2Parameters = decode_command(command, 4)?;
                controller
                    .remove_subscription(&Subscription::PropertyChange2(params))
                    .await?;
                Ok(Parameters::default())
            }
            _ => {
                log::info!("unknown method {} on {}", method, self.base);
                Err(OcaError::Status(OcaStatus::NotImplemented))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockController;
    use crate::device::DeviceConfig;
    use crate::property::ValueObject;
    use oca_core::well_known::PROPERTY_CHANGED_EVENT_ID;
    use oca_core::{Blob, Method, MethodID, decode_value};
    use std::sync::{Arc, Mutex as StdMutex};

    fn add_subscription_command(mode: NotificationDeliveryMode) -> Command {
        let params = AddSubscriptionParameters {
            event: property_changed_event(4096),
            subscriber: Method::new(1055, MethodID::new(1, 1)),
            subscriber_context: Blob::default(),
            notification_delivery_mode: mode,
            destination_information: Blob::default(),
        };
        Command::new(
            1,
            SUBSCRIPTION_MANAGER_ONO,
            methods::ADD_SUBSCRIPTION,
            Parameters::from_value(5, &params).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_add_and_remove_subscription() {
        let device = Device::new(DeviceConfig::default());
        let mut controller = MockController::new();
        controller.expect_id().return_const(1u64);
        controller
            .expect_add_subscription()
            .withf(|s| s.event() == property_changed_event(4096))
            .times(1)
            .returning(|_| Ok(()));
        controller
            .expect_remove_matching_subscriptions()
            .withf(|event, property, subscriber| {
                *event == property_changed_event(4096)
                    && property.is_none()
                    && subscriber.ono == 1055
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let context = CommandContext {
            device: device.clone(),
            controller: Arc::new(controller),
        };
        let manager = device.subscription_manager();

        manager
            .handle_command(&add_subscription_command(NotificationDeliveryMode::Normal), &context)
            .await
            .unwrap();

        let remove = RemoveSubscriptionParameters {
            event: property_changed_event(4096),
            subscriber: Method::new(1055, MethodID::new(1, 1)),
        };
        let command = Command::new(
            2,
            SUBSCRIPTION_MANAGER_ONO,
            methods::REMOVE_SUBSCRIPTION,
            Parameters::from_value(2, &remove).unwrap(),
        );
        manager.handle_command(&command, &context).await.unwrap();
    }

    #[tokio::test]
    async fn test_lightweight_without_support() {
        let device = Device::new(DeviceConfig::default());
        let mut controller = MockController::new();
        controller.expect_id().return_const(1u64);
        controller.expect_supports_lightweight().return_const(false);
        let context = CommandContext {
            device: device.clone(),
            controller: Arc::new(controller),
        };
        let err = device
            .subscription_manager()
            .handle_command(&add_subscription_command(NotificationDeliveryMode::Lightweight), &context)
            .await
            .unwrap_err();
        assert_eq!(err.status(), OcaStatus::ParameterError);
    }

    #[tokio::test]
    async fn test_wrong_parameter_count() {
        let device = Device::new(DeviceConfig::default());
        let mut controller = MockController::new();
        controller.expect_id().return_const(1u64);
        let context = CommandContext {
            device: device.clone(),
            controller: Arc::new(controller),
        };
        let mut command = add_subscription_command(NotificationDeliveryMode::Normal);
        command.parameters.parameter_count = 4;
        let err = device
            .subscription_manager()
            .handle_command(&command, &context)
            .await
            .unwrap_err();
        assert_eq!(err.status(), OcaStatus::ParameterOutOfRange);
    }

    #[tokio::test]
    async fn test_maximum_subscriber_context_length() {
        let device = Device::new(DeviceConfig::default());
        let mut controller = MockController::new();
        controller.expect_id().return_const(1u64);
        let context = CommandContext {
            device: device.clone(),
            controller: Arc::new(controller),
        };
        let command = Command::new(
            1,
            SUBSCRIPTION_MANAGER_ONO,
            methods::GET_MAXIMUM_SUBSCRIBER_CONTEXT_LENGTH,
            Parameters::default(),
        );
        let params = device
            .subscription_manager()
            .handle_command(&command, &context)
            .await
            .unwrap();
        assert_eq!(params.decode::<u16>().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_disable_then_reenable_synchronizes() {
        let device = Device::new(DeviceConfig::default());
        let objects: Vec<Arc<ValueObject<u16>>> = (0..3)
            .map(|i| {
                Arc::new(ValueObject::new(
                    4096 + i,
                    ClassIdentification::new("1.1.1".parse().unwrap(), 2),
                    0,
                ))
            })
            .collect();
        for object in &objects {
            device.register(object.clone()).await.unwrap();
        }

        let events: Arc<StdMutex<Vec<(Event, Vec<u8>)>>> = Arc::default();
        let mut controller = MockController::new();
        controller.expect_id().return_const(1u64);
        let seen = events.clone();
        controller
            .expect_notify_subscribers()
            .returning(move |event, data| {
                seen.lock().unwrap().push((event, data.to_vec()));
                Ok(())
            });
        device.add_controller(Arc::new(controller)).await;

        let manager = device.subscription_manager();
        manager.disable_notifications(&device).await.unwrap();
        assert_eq!(manager.state().await, SubscriptionManagerState::EventsDisabled);

        for (i, object) in objects.iter().enumerate() {
            object
                .value()
                .set(i as u16 + 1, object.object_number(), &device)
                .await
                .unwrap();
        }
        // the second change to the same object is folded into the set
        objects[0].value().set(9, 4096, &device).await.unwrap();

        manager.reenable_notifications(&device).await.unwrap();
        assert_eq!(manager.state().await, SubscriptionManagerState::Normal);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].0,
            Event::new(SUBSCRIPTION_MANAGER_ONO, methods::NOTIFICATIONS_DISABLED_EVENT_ID)
        );
        assert_eq!(
            events[1].0,
            Event::new(SUBSCRIPTION_MANAGER_ONO, methods::SYNCHRONIZE_STATE_EVENT_ID)
        );
        let data: ObjectListEventData = decode_value(&events[1].1).unwrap();
        assert_eq!(data.object_list, vec![4096, 4097, 4098]);
        assert!(events.iter().all(|(event, _)| event.event_id != PROPERTY_CHANGED_EVENT_ID));
    }
}
