//! Device-side objects
//!
//! Every object served by a [`Device`] implements [`DeviceObject`]. The
//! methods of the root class (class identification, role and locking) are
//! handled by [`ObjectBase`], which concrete objects embed and fall back to.

use crate::controller::Controller;
use crate::device::Device;
use crate::lock::{ControllerId, LockState};
use async_trait::async_trait;
use oca_core::well_known::root;
use oca_core::{
    ClassIdentification, ONo, ObjectIdentification, OcaError, OcaResult, OcaStatus, WireDecode,
    WireEncode,
};
use oca_ocp1::{Command, Parameters};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What an object needs to know about the command it is executing
#[derive(Clone)]
pub struct CommandContext {
    pub device: Device,
    pub controller: Arc<dyn Controller>,
}

impl CommandContext {
    pub fn controller_id(&self) -> ControllerId {
        self.controller.id()
    }
}

/// Decode the parameters of a command that takes `parameter_count` parameters
///
/// # Errors
/// `BadFormat` when the data does not decode; `ParameterOutOfRange` when the
/// declared count differs
pub fn decode_command<T: WireDecode>(command: &Command, parameter_count: u8) -> OcaResult<T> {
    let value = command.parameters.decode()?;
    if command.parameters.parameter_count != parameter_count {
        log::info!(
            "command {} on {}: unexpected parameter count {}, expected {}",
            command.method_id,
            command.target_ono,
            command.parameters.parameter_count,
            parameter_count
        );
        return Err(OcaError::Status(OcaStatus::ParameterOutOfRange));
    }
    Ok(value)
}

/// Check that a command carries no parameters
pub fn decode_null_command(command: &Command) -> OcaResult<()> {
    if !command.parameters.is_empty() {
        log::info!(
            "command {} on {}: unexpected parameter count {}, expected none",
            command.method_id,
            command.target_ono,
            command.parameters.parameter_count
        );
        return Err(OcaError::Status(OcaStatus::ParameterOutOfRange));
    }
    Ok(())
}

/// Encode a single response parameter
pub fn encode_response<T: WireEncode + ?Sized>(value: &T) -> OcaResult<Parameters> {
    Parameters::from_value(1, value)
}

/// State and root-class behavior shared by every device object
pub struct ObjectBase {
    object_number: ONo,
    class_identification: ClassIdentification,
    lockable: bool,
    role: String,
    lock_state: RwLock<LockState>,
}

impl ObjectBase {
    pub fn new(object_number: ONo, class_identification: ClassIdentification) -> Self {
        Self {
            object_number,
            class_identification,
            lockable: true,
            role: object_number.to_string(),
            lock_state: RwLock::new(LockState::Unlocked),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_lockable(mut self, lockable: bool) -> Self {
        self.lockable = lockable;
        self
    }

    pub fn object_number(&self) -> ONo {
        self.object_number
    }

    pub fn class_identification(&self) -> &ClassIdentification {
        &self.class_identification
    }

    pub fn object_identification(&self) -> ObjectIdentification {
        ObjectIdentification {
            ono: self.object_number,
            class_identification: self.class_identification.clone(),
        }
    }

    pub fn lockable(&self) -> bool {
        self.lockable
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub async fn lock_state(&self) -> LockState {
        *self.lock_state.read().await
    }

    pub async fn ensure_readable(&self, controller: ControllerId) -> OcaResult<()> {
        self.lock_state.read().await.ensure_readable(controller)
    }

    pub async fn ensure_writable(&self, controller: ControllerId) -> OcaResult<()> {
        self.lock_state.read().await.ensure_writable(controller)
    }

    fn check_lockable(&self) -> OcaResult<()> {
        if self.lockable {
            Ok(())
        } else {
            Err(OcaError::Status(OcaStatus::NotImplemented))
        }
    }

    pub async fn lock_total(&self, controller: ControllerId) -> OcaResult<()> {
        self.check_lockable()?;
        self.lock_state.write().await.lock_total(controller)
    }

    pub async fn lock_read_only(&self, controller: ControllerId) -> OcaResult<()> {
        self.check_lockable()?;
        self.lock_state.write().await.lock_read_only(controller)
    }

    pub async fn unlock(&self, controller: ControllerId) -> OcaResult<()> {
        self.check_lockable()?;
        self.lock_state.write().await.unlock(controller)
    }

    /// Release any lock held by a departing controller
    pub async fn release(&self, controller: ControllerId) -> bool {
        self.lock_state.write().await.release(controller)
    }

    /// Serve the root-class methods (1.1 to 1.7)
    pub async fn handle_command(
        &self,
        command: &Command,
        context: &CommandContext,
    ) -> OcaResult<Parameters> {
        let controller = context.controller_id();
        match command.method_id {
            root::GET_CLASS_IDENTIFICATION => {
                decode_null_command(command)?;
                encode_response(&self.class_identification)
            }
            root::GET_LOCKABLE => {
                decode_null_command(command)?;
                encode_response(&self.lockable)
            }
            root::LOCK_TOTAL => {
                decode_null_command(command)?;
                self.lock_total(controller).await?;
                Ok(Parameters::default())
            }
            root::UNLOCK => {
                decode_null_command(command)?;
                self.unlock(controller).await?;
                Ok(Parameters::default())
            }
            root::GET_ROLE => {
                decode_null_command(command)?;
                encode_response(self.role.as_str())
            }
            root::LOCK_READ_ONLY => {
                decode_null_command(command)?;
                self.lock_read_only(controller).await?;
                Ok(Parameters::default())
            }
            root::GET_LOCK_STATE => {
                decode_null_command(command)?;
                encode_response(&self.lock_state().await.status())
            }
            _ => {
                log::info!("unknown method {} on {}", command.method_id, self);
                Err(OcaError::Status(OcaStatus::NotImplemented))
            }
        }
    }
}

impl fmt::Debug for ObjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBase")
            .field("object_number", &self.object_number)
            .field("class_identification", &self.class_identification)
            .field("role", &self.role)
            .finish()
    }
}

impl fmt::Display for ObjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(objectNumber: 0x{:08x}, role: {})",
            self.class_identification.class_id, self.object_number, self.role
        )
    }
}

/// An object served by a device
#[async_trait]
pub trait DeviceObject: Send + Sync {
    fn base(&self) -> &ObjectBase;

    fn object_number(&self) -> ONo {
        self.base().object_number()
    }

    /// Execute a command addressed to this object
    ///
    /// The default serves only the root-class methods.
    async fn handle_command(
        &self,
        command: &Command,
        context: &CommandContext,
    ) -> OcaResult<Parameters> {
        self.base().handle_command(command, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockController;
    use crate::device::DeviceConfig;
    use oca_core::{LockStatus, MethodID, decode_value};

    fn context(id: ControllerId) -> CommandContext {
        let mut controller = MockController::new();
        controller.expect_id().return_const(id);
        CommandContext {
            device: Device::new(DeviceConfig::default()),
            controller: Arc::new(controller),
        }
    }

    fn command(method_id: MethodID) -> Command {
        Command::new(1, 4096, method_id, Parameters::default())
    }

    fn base() -> ObjectBase {
        ObjectBase::new(4096, ClassIdentification::new("1.1.1".parse().unwrap(), 2))
            .with_role("Gain")
    }

    #[tokio::test]
    async fn test_root_getters() {
        let base = base();
        let ctx = context(1);

        let params = base.handle_command(&command(root::GET_CLASS_IDENTIFICATION), &ctx).await.unwrap();
        let ident: ClassIdentification = params.decode().unwrap();
        assert_eq!(ident.class_id.to_string(), "1.1.1");
        assert_eq!(ident.class_version, 2);

        let params = base.handle_command(&command(root::GET_ROLE), &ctx).await.unwrap();
        assert_eq!(params.parameter_count, 1);
        assert_eq!(params.decode::<String>().unwrap(), "Gain");

        let params = base.handle_command(&command(root::GET_LOCKABLE), &ctx).await.unwrap();
        assert!(decode_value::<bool>(&params.parameter_data).unwrap());
    }

    #[tokio::test]
    async fn test_root_locking() {
        let base = base();
        let a = context(1);
        let b = context(2);

        base.handle_command(&command(root::LOCK_TOTAL), &a).await.unwrap();
        let params = base.handle_command(&command(root::GET_LOCK_STATE), &a).await.unwrap();
        assert_eq!(params.decode::<LockStatus>().unwrap(), LockStatus::LockNoReadWrite);

        let err = base.handle_command(&command(root::UNLOCK), &b).await.unwrap_err();
        assert_eq!(err.status(), OcaStatus::Locked);
        assert!(base.ensure_readable(2).await.is_err());

        base.handle_command(&command(root::UNLOCK), &a).await.unwrap();
        base.handle_command(&command(root::LOCK_READ_ONLY), &b).await.unwrap();
        assert!(base.ensure_readable(1).await.is_ok());
        assert!(base.ensure_writable(1).await.is_err());
        assert!(base.release(2).await);
    }

    #[tokio::test]
    async fn test_not_lockable() {
        let base = base().with_lockable(false);
        let err = base
            .handle_command(&command(root::LOCK_TOTAL), &context(1))
            .await
            .unwrap_err();
        assert_eq!(err.status(), OcaStatus::NotImplemented);
    }

    #[tokio::test]
    async fn test_parameters_on_null_command() {
        let base = base();
        let mut cmd = command(root::GET_ROLE);
        cmd.parameters = Parameters::new(1, vec![0]);
        let err = base.handle_command(&cmd, &context(1)).await.unwrap_err();
        assert_eq!(err.status(), OcaStatus::ParameterOutOfRange);

        let err = base
            .handle_command(&command(MethodID::new(1, 9)), &context(1))
            .await
            .unwrap_err();
        assert_eq!(err.status(), OcaStatus::NotImplemented);
    }

    #[test]
    fn test_decode_command_count() {
        let mut cmd = command(MethodID::new(4, 2));
        cmd.parameters = Parameters::from_value(2, &7u16).unwrap();
        assert!(matches!(
            decode_command::<u16>(&cmd, 1),
            Err(OcaError::Status(OcaStatus::ParameterOutOfRange))
        ));
        cmd.parameters.parameter_count = 1;
        assert_eq!(decode_command::<u16>(&cmd, 1).unwrap(), 7);
    }
}
