//! Device-side properties
//!
//! A [`DeviceProperty`] holds one property value and serves its getter and
//! setter methods. Setting the value raises the property-changed event on the
//! owning object.

use crate::device::Device;
use crate::object::{
    CommandContext, DeviceObject, ObjectBase, decode_command, decode_null_command,
    encode_response,
};
use async_trait::async_trait;
use oca_core::{
    ClassIdentification, MethodID, ONo, OcaResult, PropertyID, WireDecode, WireEncode,
};
use oca_ocp1::{Command, Parameters};
use std::fmt::Debug;
use tokio::sync::RwLock;

/// One property of a device object
pub struct DeviceProperty<T> {
    property_id: PropertyID,
    get_method: MethodID,
    set_method: Option<MethodID>,
    value: RwLock<T>,
}

impl<T> DeviceProperty<T>
where
    T: WireEncode + WireDecode + Clone + Debug + Send + Sync,
{
    pub fn new(
        property_id: PropertyID,
        get_method: MethodID,
        set_method: Option<MethodID>,
        value: T,
    ) -> Self {
        Self {
            property_id,
            get_method,
            set_method,
            value: RwLock::new(value),
        }
    }

    pub fn property_id(&self) -> PropertyID {
        self.property_id
    }

    pub async fn get(&self) -> T {
        self.value.read().await.clone()
    }

    /// Store a new value and notify subscribers on behalf of `emitter`
    pub async fn set(&self, value: T, emitter: ONo, device: &Device) -> OcaResult<()> {
        *self.value.write().await = value.clone();
        log::trace!("{} on {} set to {:?}", self.property_id, emitter, value);
        device
            .notify_property_changed(emitter, self.property_id, &value)
            .await
    }

    /// Serve the getter or setter of this property
    ///
    /// Returns `None` when the command is for some other method.
    pub async fn handle_command(
        &self,
        command: &Command,
        base: &ObjectBase,
        context: &CommandContext,
    ) -> Option<OcaResult<Parameters>> {
        if command.method_id == self.get_method {
            Some(self.handle_get(command, base, context).await)
        } else if Some(command.method_id) == self.set_method {
            Some(self.handle_set(command, base, context).await)
        } else {
            None
        }
    }

    async fn handle_get(
        &self,
        command: &Command,
        base: &ObjectBase,
        context: &CommandContext,
    ) -> OcaResult<Parameters> {
        decode_null_command(command)?;
        base.ensure_readable(context.controller_id()).await?;
        encode_response(&self.get().await)
    }

    async fn handle_set(
        &self,
        command: &Command,
        base: &ObjectBase,
        context: &CommandContext,
    ) -> OcaResult<Parameters> {
        let value: T = decode_command(command, 1)?;
        base.ensure_writable(context.controller_id()).await?;
        self.set(value, base.object_number(), &context.device).await?;
        Ok(Parameters::default())
    }
}

/// An object exposing a single settable value
///
/// The value is property 4.1, read by method 4.1 and written by method 4.2.
pub struct ValueObject<T> {
    base: ObjectBase,
    value: DeviceProperty<T>,
}

impl<T> ValueObject<T>
where
    T: WireEncode + WireDecode + Clone + Debug + Send + Sync,
{
    pub const VALUE_PROPERTY: PropertyID = PropertyID::new(4, 1);
    pub const GET_VALUE: MethodID = MethodID::new(4, 1);
    pub const SET_VALUE: MethodID = MethodID::new(4, 2);

    pub fn new(object_number: ONo, class_identification: ClassIdentification, value: T) -> Self {
        Self::with_base(ObjectBase::new(object_number, class_identification), value)
    }

    pub fn with_base(base: ObjectBase, value: T) -> Self {
        Self {
            base,
            value: DeviceProperty::new(
                Self::VALUE_PROPERTY,
                Self::GET_VALUE,
                Some(Self::SET_VALUE),
                value,
            ),
        }
    }

    pub fn value(&self) -> &DeviceProperty<T> {
        &self.value
    }
}

#[async_trait]
impl<T> DeviceObject for ValueObject<T>
where
    T: WireEncode + WireDecode + Clone + Debug + Send + Sync + 'static,
{
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    async fn handle_command(
        &self,
        command: &Command,
        context: &CommandContext,
    ) -> OcaResult<Parameters> {
        if let Some(result) = self.value.handle_command(command, &self.base, context).await {
            return result;
        }
        self.base.handle_command(command, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockController;
    use crate::device::DeviceConfig;
    use oca_core::params::PropertyChangedEventData;
    use oca_core::{OcaStatus, PropertyChangeType, decode_value};
    use std::sync::Arc;

    type Gain = ValueObject<f32>;

    fn gain() -> Gain {
        ValueObject::new(4096, ClassIdentification::new("1.1.1.5".parse().unwrap(), 2), -6.0)
    }

    #[tokio::test]
    async fn test_get_and_set() {
        let device = Device::new(DeviceConfig::default());
        let object = gain();

        let mut controller = MockController::new();
        controller.expect_id().return_const(1u64);
        // the setting controller is itself subscribed and sees the change
        controller
            .expect_notify_subscribers()
            .withf(|event, data| {
                let data: PropertyChangedEventData<f32> = decode_value(data).unwrap();
                event.emitter_ono == 4096
                    && data.property_id == Gain::VALUE_PROPERTY
                    && data.property_value == 3.0
                    && data.change_type == PropertyChangeType::CurrentChanged
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let controller: Arc<MockController> = Arc::new(controller);
        device.add_controller(controller.clone()).await;
        let context = CommandContext {
            device: device.clone(),
            controller,
        };

        let set = Command::new(1, 4096, Gain::SET_VALUE, Parameters::from_value(1, &3.0f32).unwrap());
        object.handle_command(&set, &context).await.unwrap();

        let get = Command::new(2, 4096, Gain::GET_VALUE, Parameters::default());
        let params = object.handle_command(&get, &context).await.unwrap();
        assert_eq!(params.decode::<f32>().unwrap(), 3.0);

        // root methods still reach the base
        let role = Command::new(3, 4096, oca_core::well_known::root::GET_ROLE, Parameters::default());
        assert!(object.handle_command(&role, &context).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_respects_lock() {
        let device = Device::new(DeviceConfig::default());
        let object = gain();
        object.base().lock_read_only(2).await.unwrap();

        let mut controller = MockController::new();
        controller.expect_id().return_const(1u64);
        let context = CommandContext {
            device,
            controller: Arc::new(controller),
        };

        let set = Command::new(1, 4096, Gain::SET_VALUE, Parameters::from_value(1, &1.0f32).unwrap());
        let err = object.handle_command(&set, &context).await.unwrap_err();
        assert_eq!(err.status(), OcaStatus::Locked);
        assert_eq!(object.value().get().await, -6.0);

        // reading stays allowed under a read-only lock
        let get = Command::new(2, 4096, Gain::GET_VALUE, Parameters::default());
        assert!(object.handle_command(&get, &context).await.is_ok());
    }
}
