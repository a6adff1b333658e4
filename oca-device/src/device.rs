//! The device: object table, command dispatch and event fan-out

use crate::controller::{Controller, StreamController};
use crate::lock::ControllerId;
use crate::object::{CommandContext, DeviceObject};
use crate::subscription_manager::SubscriptionManager;
use oca_core::params::{PropertyChangedEventData, property_changed_event};
use oca_core::well_known::{MAXIMUM_RESERVED_ONO, SUBSCRIPTION_MANAGER_ONO};
use oca_core::{
    Event, ONo, OcaError, OcaResult, OcaStatus, PropertyChangeType, PropertyID, WireEncode,
    encode_value,
};
use oca_ocp1::{CodecOptions, Command, Response};
use oca_transport::StreamAccessor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Upper bound on the execution of one command; zero disables it
    pub command_timeout: Duration,
    /// Reported by getMaximumSubscriberContextLength
    pub max_subscriber_context_length: u16,
    /// Accept command and response extensions on the wire
    pub enable_extensions: bool,
    /// Largest PDU a controller's batch grows to; `None` sizes it for the
    /// transport
    pub batch_size: Option<usize>,
    /// Longest time an outgoing message waits in a batch; zero sends every
    /// message on its own
    pub batch_threshold: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            max_subscriber_context_length: 4,
            enable_extensions: false,
            batch_size: None,
            batch_threshold: Duration::ZERO,
        }
    }
}

impl DeviceConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_extensions(mut self, enable: bool) -> Self {
        self.enable_extensions = enable;
        self
    }

    /// Batch messages sent to controllers
    ///
    /// # Arguments
    /// * `batch_size` - Largest PDU, header included; `None` for the
    ///   transport's default
    /// * `threshold` - Longest time a message waits for others to join it
    pub fn with_batching(mut self, batch_size: Option<usize>, threshold: Duration) -> Self {
        self.batch_size = batch_size;
        self.batch_threshold = threshold;
        self
    }

    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            extensions: self.enable_extensions,
        }
    }
}

struct DeviceInner {
    config: DeviceConfig,
    objects: RwLock<HashMap<ONo, Arc<dyn DeviceObject>>>,
    next_object_number: Mutex<ONo>,
    controllers: RwLock<HashMap<ControllerId, Arc<dyn Controller>>>,
    next_controller_id: AtomicU64,
    subscription_manager: Arc<SubscriptionManager>,
}

/// Events raised while a command executes; `None` once the command is done
type DeferredEvents = Arc<std::sync::Mutex<Option<Vec<(Event, Vec<u8>)>>>>;

/// An OCA device
///
/// Cloning is cheap; clones share the same object table and controllers.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
    deferred: Option<DeferredEvents>,
}

impl Device {
    /// Create a device holding only the subscription manager
    pub fn new(config: DeviceConfig) -> Self {
        let subscription_manager = Arc::new(SubscriptionManager::new());
        let mut objects: HashMap<ONo, Arc<dyn DeviceObject>> = HashMap::new();
        objects.insert(SUBSCRIPTION_MANAGER_ONO, subscription_manager.clone());
        Self {
            inner: Arc::new(DeviceInner {
                config,
                objects: RwLock::new(objects),
                next_object_number: Mutex::new(MAXIMUM_RESERVED_ONO + 1),
                controllers: RwLock::new(HashMap::new()),
                next_controller_id: AtomicU64::new(1),
                subscription_manager,
            }),
            deferred: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn subscription_manager(&self) -> &Arc<SubscriptionManager> {
        &self.inner.subscription_manager
    }

    /// Add an object to the object table
    ///
    /// # Arguments
    /// * `object` - The object, served under its own object number
    ///
    /// # Returns
    /// `Ok` once commands for the object number reach the object
    ///
    /// # Errors
    /// `InvalidObject` for object number 0, `DuplicateObject` when the number
    /// is taken
    pub async fn register(&self, object: Arc<dyn DeviceObject>) -> OcaResult<()> {
        let ono = object.object_number();
        if ono == 0 {
            return Err(OcaError::InvalidObject(ono));
        }
        let mut objects = self.inner.objects.write().await;
        if objects.contains_key(&ono) {
            return Err(OcaError::DuplicateObject(ono));
        }
        log::debug!("registered {}", object.base());
        objects.insert(ono, object);
        Ok(())
    }

    /// Remove an object from the object table
    ///
    /// Commands for `ono` are answered with `BadONo` afterwards.
    ///
    /// # Arguments
    /// * `ono` - Object number of the object
    ///
    /// # Returns
    /// The removed object
    ///
    /// # Errors
    /// `InvalidObject` when no object has the number
    pub async fn deregister(&self, ono: ONo) -> OcaResult<Arc<dyn DeviceObject>> {
        self.inner
            .objects
            .write()
            .await
            .remove(&ono)
            .ok_or(OcaError::InvalidObject(ono))
    }

    pub async fn resolve(&self, ono: ONo) -> Option<Arc<dyn DeviceObject>> {
        self.inner.objects.read().await.get(&ono).cloned()
    }

    pub async fn object_numbers(&self) -> Vec<ONo> {
        let mut numbers: Vec<ONo> = self.inner.objects.read().await.keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    /// Hand out the next unused object number above the reserved range
    pub async fn allocate_object_number(&self) -> OcaResult<ONo> {
        let mut next = self.inner.next_object_number.lock().await;
        let objects = self.inner.objects.read().await;
        while objects.contains_key(&*next) {
            *next = next.checked_add(1).ok_or(OcaError::InvalidObject(*next))?;
        }
        let ono = *next;
        *next = next.checked_add(1).ok_or(OcaError::InvalidObject(ono))?;
        Ok(ono)
    }

    pub fn next_controller_id(&self) -> ControllerId {
        self.inner.next_controller_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn add_controller(&self, controller: Arc<dyn Controller>) {
        self.inner
            .controllers
            .write()
            .await
            .insert(controller.id(), controller);
    }

    /// Forget a controller and release every lock it holds
    pub async fn remove_controller(&self, id: ControllerId) {
        let removed = self.inner.controllers.write().await.remove(&id);
        if removed.is_some() {
            log::debug!("removed controller {}", id);
        }
        self.unlock_all(id).await;
    }

    pub async fn controller_count(&self) -> usize {
        self.inner.controllers.read().await.len()
    }

    /// Release all locks held by a controller
    pub async fn unlock_all(&self, id: ControllerId) {
        let objects: Vec<Arc<dyn DeviceObject>> =
            self.inner.objects.read().await.values().cloned().collect();
        for object in objects {
            if object.base().release(id).await {
                log::debug!("released lock of controller {} on {}", id, object.base());
            }
        }
    }

    /// Execute a command on behalf of a controller and build its response
    ///
    /// Failures never escape: they become the status of the response. Events
    /// the command raises reach subscribers after it finished, so slow
    /// subscribers do not count against the command timeout.
    pub async fn handle_command(
        &self,
        command: &Command,
        controller: Arc<dyn Controller>,
    ) -> Response {
        let Some(object) = self.resolve(command.target_ono).await else {
            log::debug!(
                "command {} for unknown object {}",
                command.method_id,
                command.target_ono
            );
            return Response::status(command.handle, OcaStatus::BadONo);
        };

        let deferred: DeferredEvents = Arc::new(std::sync::Mutex::new(Some(Vec::new())));
        let context = CommandContext {
            device: Device {
                inner: self.inner.clone(),
                deferred: Some(deferred.clone()),
            },
            controller,
        };
        let timeout = self.inner.config.command_timeout;
        let execution = object.handle_command(command, &context);
        let result = if timeout.is_zero() {
            execution.await
        } else {
            tokio::time::timeout(timeout, execution)
                .await
                .unwrap_or(Err(OcaError::Status(OcaStatus::Timeout)))
        };

        // later events of the command, e.g. from tasks it spawned, go out directly
        let events = deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        for (event, event_data) in events {
            self.fan_out(event, &event_data).await;
        }

        match result {
            Ok(parameters) => Response::new(command.handle, OcaStatus::Ok, parameters),
            Err(e) => {
                let status = e.status();
                if status == OcaStatus::DeviceError {
                    log::warn!(
                        "command {} on {} failed: {}",
                        command.method_id,
                        object.base(),
                        e
                    );
                } else {
                    log::debug!(
                        "command {} on {} returned {}",
                        command.method_id,
                        object.base(),
                        status
                    );
                }
                Response::status(command.handle, status)
            }
        }
    }

    /// Raise an event
    ///
    /// While notifications are disabled the emitter is only recorded for
    /// the synchronize-state event.
    pub async fn notify_subscribers(&self, event: Event, event_data: &[u8]) -> OcaResult<()> {
        if self
            .inner
            .subscription_manager
            .suppress(event.emitter_ono)
            .await
        {
            return Ok(());
        }
        self.deliver(event, event_data).await;
        Ok(())
    }

    /// Raise the property-changed event for a new current value
    pub async fn notify_property_changed<T: WireEncode + Clone>(
        &self,
        emitter: ONo,
        property_id: PropertyID,
        value: &T,
    ) -> OcaResult<()> {
        let data = encode_value(&PropertyChangedEventData {
            property_id,
            property_value: value.clone(),
            change_type: PropertyChangeType::CurrentChanged,
        })?;
        self.notify_subscribers(property_changed_event(emitter), &data)
            .await
    }

    /// Send an event to every controller, bypassing the disabled state
    ///
    /// Within a command the event waits until the command finished.
    pub(crate) async fn deliver(&self, event: Event, event_data: &[u8]) {
        if !self.defer(event, event_data) {
            self.fan_out(event, event_data).await;
        }
    }

    fn defer(&self, event: Event, event_data: &[u8]) -> bool {
        let Some(deferred) = &self.deferred else {
            return false;
        };
        match deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(events) => {
                events.push((event, event_data.to_vec()));
                true
            }
            None => false,
        }
    }

    async fn fan_out(&self, event: Event, event_data: &[u8]) {
        let controllers: Vec<Arc<dyn Controller>> =
            self.inner.controllers.read().await.values().cloned().collect();
        for controller in controllers {
            if let Err(e) = controller.notify_subscribers(event, event_data).await {
                log::warn!(
                    "failed to notify controller {} of {}: {}",
                    controller.id(),
                    event,
                    e
                );
            }
        }
    }

    /// Serve one controller connection in a background task
    pub fn serve(&self, stream: Arc<dyn StreamAccessor>) -> (Arc<StreamController>, JoinHandle<()>) {
        let controller = Arc::new(StreamController::new(
            self.next_controller_id(),
            stream,
            &self.inner.config,
        ));
        let task = tokio::spawn(controller.clone().run(self.clone()));
        (controller, task)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.inner.config)
            .finish()
    }
}
