//! Controller connection engine
//!
//! A [`Connection`] owns the link to one device. Commands are numbered with
//! handles, queued through the message batcher and matched to their
//! Responses by the link's monitor task, which also routes notifications to
//! event subscribers and exchanges keepalives.
//!
//! # Lifecycle
//!
//! 1. **Create**: [`Connection::new`] with a transport and [`ConnectionOptions`]
//! 2. **Connect**: [`Connection::connect`] opens the transport and starts the monitor
//! 3. **Use**: call methods, resolve objects, subscribe to events
//! 4. **Disconnect**: [`Connection::disconnect`] removes subscriptions and closes the link
//!
//! When the link fails, the connection state changes to
//! `ConnectionTimedOut` or `ConnectionFailed`, every outstanding command fails
//! with `NotConnected`, and, depending on the [`ReconnectionPolicy`], the
//! connection is re-established with backoff. Object proxies and event
//! subscriptions survive a reconnection.

use crate::cache::ObjectCache;
use crate::monitor::{Activity, LinkMonitor, PendingGuard, PendingRequests};
use crate::object::{ObjectFactory, RemoteObject};
use crate::options::{ConnectionOptions, ReconnectionPolicy};
use crate::property::{CommandChannel, PropertyResolutionFlags};
use crate::state::ConnectionState;
use async_trait::async_trait;
use bytes::Bytes;
use oca_core::params::{AddSubscriptionParameters, RemoveSubscriptionParameters};
use oca_core::well_known::{
    DEFAULT_SUBSCRIBER_METHOD_ID, DEFAULT_SUBSCRIBER_ONO, ROOT_BLOCK_ONO,
    SUBSCRIPTION_MANAGER_ONO, root, subscription_manager,
};
use oca_core::{
    Blob, ClassID, ClassIdentification, ClassRegistry, ClassVersion, Event, Method, MethodID,
    NotificationDeliveryMode, ONo, OcaError, OcaResult, PropertyID, WireDecode, WireEncode,
};
use oca_ocp1::{Command, KeepAlive, Message, MessageBatcher, Parameters, PduSink, Response};
use oca_transport::{StreamAccessor, TransportLayer};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Receives the data of a subscribed event, or the exception the device
/// raised in its place
pub type EventCallback = Arc<dyn Fn(Event, Result<&[u8], &OcaError>) + Send + Sync>;

/// Identifies one callback added with [`Connection::add_subscription`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    event: Event,
    id: u64,
}

impl SubscriptionToken {
    pub fn event(&self) -> Event {
        self.event
    }
}

/// Writes framed PDUs to the link and records the time of the last send
struct LinkSink {
    stream: Arc<dyn StreamAccessor>,
    activity: Arc<Activity>,
}

#[async_trait]
impl PduSink for LinkSink {
    async fn send_pdu(&self, pdu: Bytes) -> OcaResult<()> {
        log::trace!("sending {} byte PDU", pdu.len());
        self.stream.write_all(&pdu).await?;
        self.activity.sent();
        Ok(())
    }
}

struct Link {
    id: u64,
    stream: Arc<dyn StreamAccessor>,
    batcher: Arc<MessageBatcher>,
    monitor: JoinHandle<()>,
}

type Subscribers = HashMap<Event, Vec<(u64, EventCallback)>>;

pub(crate) struct ConnectionInner {
    transport: Arc<dyn TransportLayer>,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    next_link_id: AtomicU64,
    pub(crate) pending: PendingRequests,
    subscriptions: Mutex<Subscribers>,
    next_subscription_id: AtomicU64,
    cache: ObjectCache<Arc<RemoteObject>>,
    registry: RwLock<ClassRegistry<ObjectFactory>>,
}

impl ConnectionInner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            log::debug!("{}: {}", self.transport.description(), next);
        }
    }

    /// Finish connecting; a datagram link only does so once the device has
    /// answered
    pub(crate) fn mark_connected(&self) {
        self.state.send_if_modified(|state| {
            if !state.is_connecting() {
                return false;
            }
            *state = ConnectionState::Connected;
            true
        });
    }

    /// Hand event data to every callback subscribed to `event`, in
    /// subscription order
    pub(crate) async fn deliver_event(&self, event: Event, result: Result<&[u8], &OcaError>) {
        let callbacks: Vec<EventCallback> = self
            .subscriptions
            .lock()
            .await
            .get(&event)
            .map(|entries| entries.iter().map(|(_, callback)| callback.clone()).collect())
            .unwrap_or_default();
        if callbacks.is_empty() {
            log::debug!("no subscriber for event {}", event);
        }
        for callback in callbacks {
            callback(event, result);
        }
    }

    fn factory(&self, identification: &ClassIdentification) -> OcaResult<ObjectFactory> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.resolve(identification).cloned()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.monitor.abort();
        }
    }
}

/// Connection to one device
///
/// Cloning is cheap; clones share the link, the object cache and the
/// subscriptions.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a disconnected connection
    ///
    /// The class registry starts with the root class, so any object resolves
    /// to at least a [`RemoteObject`] with the root properties.
    ///
    /// # Arguments
    /// * `transport` - Opens the link on every connect and reconnect
    /// * `options` - Timeouts, heartbeat, batching and reconnection behavior
    pub fn new(transport: Arc<dyn TransportLayer>, options: ConnectionOptions) -> Self {
        let mut registry: ClassRegistry<ObjectFactory> = ClassRegistry::new();
        let root_factory: ObjectFactory = Arc::new(RemoteObject::new);
        // an empty registry cannot already hold the root class
        let _ = registry.register(ClassID::new(vec![1]), 1, root_factory);

        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                cache: ObjectCache::new(options.object_cache_capacity),
                options,
                state: watch::Sender::new(ConnectionState::NotConnected),
                link: Mutex::new(None),
                next_link_id: AtomicU64::new(1),
                pending: PendingRequests::new(),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(1),
                registry: RwLock::new(registry),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn description(&self) -> String {
        self.inner.transport.description()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Follow connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of commands waiting for a Response
    pub fn outstanding_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn object_cache(&self) -> &ObjectCache<Arc<RemoteObject>> {
        &self.inner.cache
    }

    /// Register the proxy factory of a class version
    ///
    /// # Arguments
    /// * `class_id` - Class the factory builds proxies for
    /// * `version` - Class version of the factory
    /// * `factory` - Builds the proxy of an object of the class or a subclass
    ///
    /// # Errors
    /// `Status(ParameterError)` when the class version is already registered
    pub fn register_class(
        &self,
        class_id: ClassID,
        version: ClassVersion,
        factory: ObjectFactory,
    ) -> OcaResult<()> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(class_id, version, factory)
    }

    /// Move to `next` unless connected or already connecting
    fn begin(&self, next: ConnectionState) -> OcaResult<()> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| match state {
            ConnectionState::Connected => {
                result = Err(OcaError::AlreadyConnected);
                false
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                result = Err(OcaError::ConnectionAlreadyInProgress);
                false
            }
            _ => {
                *state = next;
                true
            }
        });
        result
    }

    /// Open the transport and start the connection
    ///
    /// # Returns
    /// `Ok` once the link is up; subscriptions recorded while disconnected
    /// are then added on the device
    ///
    /// # Errors
    /// `AlreadyConnected`, `ConnectionAlreadyInProgress`, `ConnectionTimeout`
    /// when the transport does not connect within the connection timeout, or
    /// the transport's own error
    pub async fn connect(&self) -> OcaResult<()> {
        self.begin(ConnectionState::Connecting)?;
        log::info!("connecting to {}", self.description());
        if let Err(e) = self.open_link().await {
            log::warn!("failed to connect to {}: {}", self.description(), e);
            self.inner.set_state(ConnectionState::from_error(&e));
            return Err(e);
        }
        self.did_connect(false).await;
        Ok(())
    }

    async fn open_link(&self) -> OcaResult<()> {
        let options = &self.inner.options;
        let stream = tokio::time::timeout(options.connection_timeout, self.inner.transport.open())
            .await
            .map_err(|_| OcaError::ConnectionTimeout)?
            .map_err(|e| match e {
                OcaError::ResponseTimeout => OcaError::ConnectionTimeout,
                e => e,
            })?;

        let codec = options.codec_options();
        let activity = Arc::new(Activity::new());
        let sink = Arc::new(LinkSink {
            stream: stream.clone(),
            activity: activity.clone(),
        });
        let batcher = Arc::new(match options.batching {
            Some(batching) => MessageBatcher::new(
                batching.batch_size,
                batching.batch_threshold,
                codec,
                sink,
            ),
            None => MessageBatcher::unbatched(codec, sink),
        });

        let id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed);
        let monitor = LinkMonitor {
            link_id: id,
            connection: Arc::downgrade(&self.inner),
            stream: stream.clone(),
            batcher: batcher.clone(),
            activity,
            heartbeat: options.heartbeat,
            options: codec,
        };
        let link = Link {
            id,
            stream,
            batcher,
            monitor: tokio::spawn(monitor.run()),
        };

        if let Some(previous) = self.inner.link.lock().await.replace(link) {
            self.shutdown_link(previous, true, &OcaError::NotConnected).await;
        }
        Ok(())
    }

    async fn did_connect(&self, reconnected: bool) {
        let flags = self.inner.options.flags;
        if !self.inner.transport.is_datagram() {
            self.inner.mark_connected();
        }
        log::info!("connected to {}", self.description());

        let heartbeat = self.inner.options.heartbeat;
        if !heartbeat.is_zero() {
            let keep_alive = Message::KeepAlive(KeepAlive::from_duration(heartbeat));
            if let Err(e) = self.enqueue(keep_alive).await {
                log::warn!("failed to send keepalive: {}", e);
            }
        }

        if reconnected {
            for object in self.inner.cache.values() {
                object.refresh();
            }
        }
        if !reconnected || flags.refresh_subscriptions_on_reconnection {
            self.refresh_subscriptions().await;
        }
        if flags.refresh_device_tree_on_connection {
            if let Err(e) = self.resolve_object(ROOT_BLOCK_ONO).await {
                log::warn!("failed to resolve root block: {}", e);
            }
        }
    }

    /// Remove subscriptions and close the link
    ///
    /// Commands still waiting for a Response fail with `Cancelled`. The
    /// object cache is cleared unless the connection retains it.
    ///
    /// # Returns
    /// `Ok` once the connection is back in `NotConnected`; removing the
    /// subscriptions from the device is best effort
    pub async fn disconnect(&self) -> OcaResult<()> {
        self.inner.set_state(ConnectionState::Disconnecting);
        self.remove_all_subscriptions().await;
        if let Some(link) = self.take_link(None).await {
            self.shutdown_link(link, true, &OcaError::Cancelled).await;
        }
        if !self.inner.options.flags.retain_object_cache_after_disconnect {
            self.inner.cache.remove_all();
        }
        self.inner.set_state(ConnectionState::NotConnected);
        log::info!("disconnected from {}", self.description());
        Ok(())
    }

    /// Take the current link, or only the link `link_id` when given
    async fn take_link(&self, link_id: Option<u64>) -> Option<Link> {
        let mut link = self.inner.link.lock().await;
        let current = match (link.as_ref(), link_id) {
            (Some(current), Some(id)) => current.id == id,
            _ => true,
        };
        if current { link.take() } else { None }
    }

    /// Close a link and fail its outstanding commands with `reason`
    async fn shutdown_link(&self, link: Link, abort_monitor: bool, reason: &OcaError) {
        if abort_monitor {
            link.monitor.abort();
        }
        if let Err(e) = link.stream.close().await {
            log::debug!("error closing link {}: {}", link.id, e);
        }
        self.inner.pending.fail_all(reason);
    }

    /// Called by the monitor of link `link_id` when the link failed
    pub(crate) async fn monitor_failed(&self, link_id: u64, error: OcaError) {
        let Some(link) = self.take_link(Some(link_id)).await else {
            return;
        };
        if error.is_decode_error() {
            log::warn!("closing connection to {}: {}", self.description(), error);
        } else {
            log::info!("connection to {} lost: {}", self.description(), error);
        }
        self.shutdown_link(link, false, &OcaError::NotConnected).await;

        if !error.is_recoverable() {
            self.inner.set_state(ConnectionState::ConnectionFailed);
            return;
        }
        self.inner.set_state(ConnectionState::from_error(&error));
        if self.inner.options.reconnection_policy() == ReconnectionPolicy::ReconnectInMonitor {
            tokio::spawn(self.reconnect_in_background());
        }
    }

    // Boxed to break the type cycle between the monitor task and reconnect,
    // which spawns a new monitor.
    fn reconnect_in_background(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let connection = self.clone();
        Box::pin(async move {
            if let Err(e) = connection.reconnect().await {
                log::error!("giving up reconnecting to {}: {}", connection.description(), e);
            }
        })
    }

    /// Re-establish the link, pausing between failed attempts
    ///
    /// The pause doubles after each attempt in the exponential backoff range.
    /// Subscriptions are replayed when the options ask for it.
    ///
    /// # Errors
    /// `AlreadyConnected` or `ConnectionAlreadyInProgress` when there is
    /// nothing to reconnect, `NotConnected` when the connection is
    /// disconnected meanwhile, or the error of the last attempt
    pub async fn reconnect(&self) -> OcaResult<()> {
        self.begin(ConnectionState::Reconnecting)?;
        if let Some(link) = self.take_link(None).await {
            self.shutdown_link(link, true, &OcaError::NotConnected).await;
        }

        let options = &self.inner.options;
        let tries = options.reconnect_max_tries.max(1);
        let mut pause = options.reconnect_pause_interval;
        let mut last_error = OcaError::NotConnected;
        for attempt in 0..tries {
            log::info!(
                "reconnecting to {} (attempt {} of {})",
                self.description(),
                attempt + 1,
                tries
            );
            match self.open_link().await {
                Ok(()) if self.state() != ConnectionState::Reconnecting => {
                    // disconnected while the link was opening
                    if let Some(link) = self.take_link(None).await {
                        self.shutdown_link(link, true, &OcaError::Cancelled).await;
                    }
                    return Err(OcaError::NotConnected);
                }
                Ok(()) => {
                    self.did_connect(true).await;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("reconnection to {} failed: {}", self.description(), e);
                    last_error = e;
                }
            }
            if attempt + 1 == tries {
                break;
            }
            if options
                .reconnect_exponential_backoff_threshold
                .contains(&attempt)
            {
                pause *= 2;
            }
            tokio::time::sleep(pause).await;
            // disconnected in the meantime
            if self.state() != ConnectionState::Reconnecting {
                return Err(OcaError::NotConnected);
            }
        }

        self.inner.set_state(match ConnectionState::from_error(&last_error) {
            ConnectionState::NotConnected => ConnectionState::ConnectionFailed,
            state => state,
        });
        Err(last_error)
    }

    async fn reconnect_if_needed(&self) -> OcaResult<()> {
        if self.inner.options.reconnection_policy() == ReconnectionPolicy::ReconnectOnSend
            && self.state().is_failed()
        {
            // reconnecting replays subscriptions, which sends commands
            Box::pin(self.reconnect()).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, message: Message) -> OcaResult<()> {
        let batcher = self
            .inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.batcher.clone())
            .ok_or(OcaError::NotConnected)?;
        if let Err(e) = batcher.enqueue(&message).await {
            self.send_failed(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Drop a link that failed to send, unless its monitor reconnects it
    async fn send_failed(&self, error: &OcaError) {
        if !error.is_recoverable()
            || self.inner.options.reconnection_policy() == ReconnectionPolicy::ReconnectInMonitor
        {
            return;
        }
        if let Some(link) = self.take_link(None).await {
            log::info!("connection to {} lost: {}", self.description(), error);
            self.shutdown_link(link, true, &OcaError::NotConnected).await;
            self.inner.set_state(ConnectionState::from_error(error));
        }
    }

    /// Send a command without asking for a Response
    ///
    /// # Arguments
    /// * `command` - The command; its handle is replaced by a fresh one
    ///
    /// # Errors
    /// `NotConnected` without a link, or the error of sending the command
    pub async fn send_command(&self, mut command: Command) -> OcaResult<()> {
        self.reconnect_if_needed().await?;
        command.handle = self.inner.pending.allocate();
        log::trace!(
            "sending {} to {} with handle {}",
            command.method_id,
            command.target_ono,
            command.handle
        );
        self.enqueue(Message::Command(command)).await
    }

    /// Send a command and wait for its Response
    ///
    /// The command's handle is replaced by a fresh one. A Response that
    /// arrives after the response timeout is dropped.
    ///
    /// # Errors
    /// `ResponseTimeout`, `NotConnected` when the link goes down before the
    /// Response arrives, `Cancelled` when the connection is disconnected in
    /// the meantime, or the error of sending the command
    pub async fn send_command_rrq(&self, mut command: Command) -> OcaResult<Response> {
        self.reconnect_if_needed().await?;
        let (handle, receiver) = self.inner.pending.register();
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            handle,
        };
        command.handle = handle;
        log::trace!(
            "calling {} on {} with handle {}",
            command.method_id,
            command.target_ono,
            handle
        );
        self.enqueue(Message::CommandRrq(command)).await?;

        match tokio::time::timeout(self.inner.options.response_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcaError::NotConnected),
            Err(_) => {
                log::debug!("no response for handle {}", handle);
                Err(OcaError::ResponseTimeout)
            }
        }
    }

    /// Call a method and return its response parameters
    ///
    /// # Arguments
    /// * `target` - Object number of the object to call
    /// * `method_id` - Method of the object
    /// * `parameters` - Encoded method parameters
    ///
    /// # Returns
    /// The parameters of an OK Response; decoding them is up to the caller
    ///
    /// # Errors
    /// `Status` when the device answers with any status but OK, or the
    /// errors of [`send_command_rrq`](Self::send_command_rrq)
    pub async fn call(
        &self,
        target: ONo,
        method_id: MethodID,
        parameters: Parameters,
    ) -> OcaResult<Parameters> {
        let response = self
            .send_command_rrq(Command::new(0, target, method_id, parameters))
            .await?;
        if response.status_code.is_ok() {
            Ok(response.parameters)
        } else {
            Err(OcaError::Status(response.status_code))
        }
    }

    fn subscriber() -> Method {
        Method {
            ono: DEFAULT_SUBSCRIBER_ONO,
            method_id: DEFAULT_SUBSCRIBER_METHOD_ID,
        }
    }

    async fn has_link(&self) -> bool {
        self.inner.link.lock().await.is_some()
    }

    async fn send_add_subscription(&self, event: Event) -> OcaResult<()> {
        let parameters = AddSubscriptionParameters {
            event,
            subscriber: Self::subscriber(),
            subscriber_context: Blob::default(),
            notification_delivery_mode: NotificationDeliveryMode::Normal,
            destination_information: Blob::default(),
        };
        self.call(
            SUBSCRIPTION_MANAGER_ONO,
            subscription_manager::ADD_SUBSCRIPTION,
            Parameters::from_value(5, &parameters)?,
        )
        .await
        .map(|_| ())
    }

    async fn send_remove_subscription(&self, event: Event) -> OcaResult<()> {
        let parameters = RemoveSubscriptionParameters {
            event,
            subscriber: Self::subscriber(),
        };
        self.call(
            SUBSCRIPTION_MANAGER_ONO,
            subscription_manager::REMOVE_SUBSCRIPTION,
            Parameters::from_value(2, &parameters)?,
        )
        .await
        .map(|_| ())
    }

    /// Call `callback` for every notification of `event`
    ///
    /// The device subscription is added with the first callback of an
    /// event. While disconnected the callback is only recorded; the
    /// subscription is made when the connection is established.
    ///
    /// # Arguments
    /// * `event` - The event to follow
    /// * `callback` - Receives the event data, or the exception raised in
    ///   its place
    ///
    /// # Returns
    /// A token to remove the callback with
    ///
    /// # Errors
    /// The error of adding the device subscription; the callback is not kept
    pub async fn add_subscription(
        &self,
        event: Event,
        callback: EventCallback,
    ) -> OcaResult<SubscriptionToken> {
        let token = SubscriptionToken {
            event,
            id: self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed),
        };
        let first = {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            let callbacks = subscriptions.entry(event).or_default();
            callbacks.push((token.id, callback));
            callbacks.len() == 1
        };

        if first && self.has_link().await {
            if let Err(e) = self.send_add_subscription(event).await {
                self.forget_callback(&token).await;
                return Err(e);
            }
            log::debug!("subscribed to {}", event);
        }
        Ok(token)
    }

    /// Remove one callback; returns whether it was the event's last
    async fn forget_callback(&self, token: &SubscriptionToken) -> Option<bool> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let callbacks = subscriptions.get_mut(&token.event)?;
        let position = callbacks.iter().position(|(id, _)| *id == token.id)?;
        callbacks.remove(position);
        if callbacks.is_empty() {
            subscriptions.remove(&token.event);
            return Some(true);
        }
        Some(false)
    }

    /// Remove a callback added with [`add_subscription`](Self::add_subscription)
    ///
    /// # Errors
    /// `NotSubscribedToEvent` for an unknown token, or the error of removing
    /// the device subscription with the event's last callback
    pub async fn remove_subscription(&self, token: &SubscriptionToken) -> OcaResult<()> {
        let last = self
            .forget_callback(token)
            .await
            .ok_or(OcaError::NotSubscribedToEvent)?;
        if last && self.has_link().await {
            self.send_remove_subscription(token.event).await?;
            log::debug!("unsubscribed from {}", token.event);
        }
        Ok(())
    }

    pub async fn has_subscription(&self, token: &SubscriptionToken) -> bool {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(&token.event)
            .is_some_and(|callbacks| callbacks.iter().any(|(id, _)| *id == token.id))
    }

    pub async fn is_subscribed(&self, event: Event) -> bool {
        self.inner.subscriptions.lock().await.contains_key(&event)
    }

    /// Subscribed events, in event order
    pub async fn subscribed_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.inner.subscriptions.lock().await.keys().copied().collect();
        events.sort_unstable();
        events
    }

    /// Add the device subscription of every subscribed event again
    ///
    /// Failures are logged; the remaining events are still tried.
    pub async fn refresh_subscriptions(&self) {
        for event in self.subscribed_events().await {
            if let Err(e) = self.send_add_subscription(event).await {
                log::warn!("failed to refresh subscription to {}: {}", event, e);
            }
        }
    }

    async fn remove_all_subscriptions(&self) {
        let events = self.subscribed_events().await;
        if self.has_link().await {
            for event in &events {
                if let Err(e) = self.send_remove_subscription(*event).await {
                    log::debug!("failed to remove subscription to {}: {}", event, e);
                }
            }
        }
        self.inner.subscriptions.lock().await.clear();
    }

    pub fn cached_object(&self, object_number: ONo) -> Option<Arc<RemoteObject>> {
        self.inner.cache.get(object_number)
    }

    /// The proxy of an object, fetching its class identification if it is
    /// not cached
    ///
    /// # Errors
    /// The error of the class identification call,
    /// `InvalidProxyMethodResponse` when its result does not decode, or the
    /// errors of [`resolve_object_with_class`](Self::resolve_object_with_class)
    pub async fn resolve_object(&self, object_number: ONo) -> OcaResult<Arc<RemoteObject>> {
        if let Some(object) = self.inner.cache.get(object_number) {
            return Ok(object);
        }
        let identification: ClassIdentification = self
            .call(
                object_number,
                root::GET_CLASS_IDENTIFICATION,
                Parameters::default(),
            )
            .await?
            .decode_result(1, "class identification")?;
        self.resolve_object_with_class(object_number, identification)
    }

    /// The proxy of an object whose class is already known
    ///
    /// # Errors
    /// `ObjectClassMismatch` when a cached proxy has another class,
    /// `UnknownClass` when no registered class is an ancestor of the class
    pub fn resolve_object_with_class(
        &self,
        object_number: ONo,
        identification: ClassIdentification,
    ) -> OcaResult<Arc<RemoteObject>> {
        if let Some(object) = self.inner.cache.get(object_number) {
            if object.class_identification().class_id != identification.class_id {
                return Err(OcaError::ObjectClassMismatch);
            }
            return Ok(object);
        }
        let factory = self.inner.factory(&identification)?;
        let object = Arc::new(factory(object_number, identification));
        log::debug!("resolved {}", object);
        self.inner.cache.set(object_number, object.clone());
        Ok(object)
    }

    /// Read a property of an object through its proxy
    ///
    /// # Arguments
    /// * `object_number` - Object holding the property
    /// * `property_id` - The property
    /// * `flags` - How the proxy's cache is used and filled
    ///
    /// # Errors
    /// `InvalidData` when the object's class has no such property of type
    /// `T`, or the errors of [`Property::get_value`](crate::property::Property::get_value)
    pub async fn get_value<T>(
        &self,
        object_number: ONo,
        property_id: PropertyID,
        flags: PropertyResolutionFlags,
    ) -> OcaResult<T>
    where
        T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
    {
        let object = self.resolve_object(object_number).await?;
        object.get_value(self, property_id, flags).await
    }

    /// Write a property of an object through its proxy
    ///
    /// # Errors
    /// `InvalidData` when the object's class has no such property of type
    /// `T`, or the errors of [`Property::set_value`](crate::property::Property::set_value)
    pub async fn set_value<T>(
        &self,
        object_number: ONo,
        property_id: PropertyID,
        value: T,
    ) -> OcaResult<()>
    where
        T: WireEncode + WireDecode + Clone + Send + Sync + 'static,
    {
        let object = self.resolve_object(object_number).await?;
        object.set_value(self, property_id, value).await
    }
}

#[async_trait]
impl CommandChannel for Connection {
    async fn call(
        &self,
        target: ONo,
        method_id: MethodID,
        parameters: Parameters,
    ) -> OcaResult<Parameters> {
        Connection::call(self, target, method_id, parameters).await
    }

    async fn send(&self, target: ONo, method_id: MethodID, parameters: Parameters) -> OcaResult<()> {
        self.send_command(Command::new(0, target, method_id, parameters))
            .await
    }

    async fn is_subscribed(&self, event: Event) -> bool {
        Connection::is_subscribed(self, event).await
    }

    fn subscribe_in_background(&self, object_number: ONo) {
        let connection = self.clone();
        tokio::spawn(async move {
            let Some(object) = connection.cached_object(object_number) else {
                return;
            };
            if let Err(e) = object.subscribe(&connection).await {
                log::warn!("failed to subscribe to {}: {}", object, e);
            }
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.description())
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .finish()
    }
}
