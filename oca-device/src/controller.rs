//! Controllers connected to a device
//!
//! A [`StreamController`] owns one transport connection: it reads PDUs,
//! dispatches commands to the [`Device`], answers with responses and
//! delivers notifications for the subscriptions the controller registered.
//! Controllers announcing a heartbeat are expired when they go quiet for
//! three heartbeats.

use crate::device::{Device, DeviceConfig};
use crate::lock::ControllerId;
use crate::subscription::{Subscription, SubscriptionRegistry};
use async_trait::async_trait;
use oca_core::params::Ocp1NetworkAddress;
use oca_core::{Event, Method, NetworkAddress, OcaError, OcaResult, OcaStatus, PropertyID};
use bytes::Bytes;
use oca_ocp1::{
    CodecOptions, KeepAlive, Message, MessageBatcher, PduSink, default_batch_size, encode_pdu,
    receive_pdu,
};
use oca_transport::StreamAccessor;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Number of missed heartbeats after which a controller is expired
pub const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// A device's view of one connected controller
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Controller: Send + Sync {
    fn id(&self) -> ControllerId;

    /// Check if notifications can be delivered out of band over UDP
    fn supports_lightweight(&self) -> bool {
        false
    }

    async fn add_subscription(&self, subscription: Subscription) -> OcaResult<()>;

    async fn remove_subscription(&self, subscription: &Subscription) -> OcaResult<()>;

    /// Remove the EV1 subscriptions of `subscriber` to `event`
    async fn remove_matching_subscriptions(
        &self,
        event: Event,
        property: Option<PropertyID>,
        subscriber: Method,
    ) -> OcaResult<()>;

    /// Deliver an event to every matching subscription of this controller
    async fn notify_subscribers(&self, event: Event, event_data: &[u8]) -> OcaResult<()>;

    async fn send_message(&self, message: Message) -> OcaResult<()>;

    /// Forget all subscriptions, called when the controller goes away
    async fn clear_subscriptions(&self) {}
}

struct Timing {
    heartbeat: Duration,
    last_received: Instant,
    last_sent: Instant,
}

impl Timing {
    fn expired(&self, now: Instant) -> bool {
        !self.heartbeat.is_zero()
            && self.last_received + self.heartbeat * MISSED_HEARTBEAT_LIMIT < now
    }
}

/// Writes the controller's batched PDUs to its stream
struct ControllerSink {
    stream: Arc<dyn StreamAccessor>,
    timing: Arc<Mutex<Timing>>,
}

#[async_trait]
impl PduSink for ControllerSink {
    async fn send_pdu(&self, pdu: Bytes) -> OcaResult<()> {
        self.stream.write_all(&pdu).await?;
        self.timing.lock().await.last_sent = Instant::now();
        Ok(())
    }
}

/// A controller connected over a stream or datagram transport
pub struct StreamController {
    id: ControllerId,
    stream: Arc<dyn StreamAccessor>,
    options: CodecOptions,
    batcher: MessageBatcher,
    subscriptions: Mutex<SubscriptionRegistry>,
    timing: Arc<Mutex<Timing>>,
    keep_alive_task: Mutex<Option<JoinHandle<()>>>,
    lightweight_socket: Option<Arc<UdpSocket>>,
}

impl StreamController {
    /// Create the controller of one connection
    ///
    /// # Arguments
    /// * `id` - Identifies the controller in locks and logs
    /// * `stream` - The connection to the controller
    /// * `config` - Supplies the codec options and the batching of outgoing
    ///   messages; without a batch threshold every message leaves on its own
    pub fn new(id: ControllerId, stream: Arc<dyn StreamAccessor>, config: &DeviceConfig) -> Self {
        let now = Instant::now();
        let timing = Arc::new(Mutex::new(Timing {
            heartbeat: Duration::ZERO,
            last_received: now,
            last_sent: now,
        }));
        let options = config.codec_options();
        let sink = Arc::new(ControllerSink {
            stream: stream.clone(),
            timing: timing.clone(),
        });
        let batcher = if config.batch_threshold.is_zero() {
            MessageBatcher::unbatched(options, sink)
        } else {
            let batch_size = config
                .batch_size
                .unwrap_or_else(|| default_batch_size(stream.is_datagram()));
            MessageBatcher::new(batch_size, config.batch_threshold, options, sink)
        };
        Self {
            id,
            stream,
            options,
            batcher,
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            timing,
            keep_alive_task: Mutex::new(None),
            lightweight_socket: None,
        }
    }

    /// Enable lightweight notification delivery through `socket`
    pub fn with_lightweight_socket(mut self, socket: Arc<UdpSocket>) -> Self {
        self.lightweight_socket = Some(socket);
        self
    }

    pub async fn heartbeat(&self) -> Duration {
        self.timing.lock().await.heartbeat
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Serve the connection until the transport fails or the peer goes away
    ///
    /// The controller is registered with `device` for the duration; on exit
    /// its locks are released and its subscriptions dropped.
    pub async fn run(self: Arc<Self>, device: Device) {
        device.add_controller(self.clone()).await;
        log::info!("controller {} connected", self);

        match self.receive_loop(&device).await {
            Err(OcaError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::info!("controller {} disconnected", self);
            }
            Err(OcaError::NotConnected) => log::info!("controller {} closed", self),
            Err(e) => log::warn!("controller {} failed: {}", self, e),
            Ok(()) => {}
        }

        if let Some(task) = self.keep_alive_task.lock().await.take() {
            task.abort();
        }
        self.retire(&device).await;
    }

    async fn receive_loop(self: &Arc<Self>, device: &Device) -> OcaResult<()> {
        loop {
            let pdu = receive_pdu(&*self.stream, self.options).await?;
            self.timing.lock().await.last_received = Instant::now();
            for message in pdu.messages {
                self.handle_message(message, device).await?;
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Message, device: &Device) -> OcaResult<()> {
        match message {
            Message::Command(command) => {
                let response = device.handle_command(&command, self.clone()).await;
                if !response.status_code.is_ok() {
                    log::debug!(
                        "controller {}: command {} without response failed with {}",
                        self,
                        command.handle,
                        response.status_code
                    );
                }
            }
            Message::CommandRrq(command) => {
                let response = device.handle_command(&command, self.clone()).await;
                self.send_message(Message::Response(response)).await?;
            }
            Message::KeepAlive(keep_alive) => {
                self.set_heartbeat(keep_alive.heartbeat(), device).await;
            }
            other => {
                log::info!(
                    "controller {}: ignoring unexpected {:?} message",
                    self,
                    other.message_type()
                );
            }
        }
        Ok(())
    }

    /// Adopt the heartbeat announced by the controller
    async fn set_heartbeat(self: &Arc<Self>, heartbeat: Duration, device: &Device) {
        let previous = {
            let mut timing = self.timing.lock().await;
            std::mem::replace(&mut timing.heartbeat, heartbeat)
        };
        let mut task = self.keep_alive_task.lock().await;
        if heartbeat == previous && task.is_some() {
            return;
        }
        if let Some(task) = task.take() {
            task.abort();
        }
        if !heartbeat.is_zero() {
            log::debug!("controller {}: heartbeat {:?}", self, heartbeat);
            *task = Some(tokio::spawn(keep_alive_loop(
                Arc::downgrade(self),
                device.clone(),
            )));
        }
    }

    /// Drop everything the device holds for this controller
    async fn retire(&self, device: &Device) {
        device.remove_controller(self.id).await;
        self.clear_subscriptions().await;
        let _ = self.stream.close().await;
    }

    async fn send_lightweight(&self, message: Message, destination: &NetworkAddress) -> OcaResult<()> {
        let Some(socket) = &self.lightweight_socket else {
            return Err(OcaError::Status(OcaStatus::ParameterError));
        };
        let address = Ocp1NetworkAddress::from_network_address(destination)?.socket_address()?;
        let pdu = encode_pdu(&[message], self.options)?;
        socket.send_to(&pdu, address).await?;
        Ok(())
    }
}

async fn keep_alive_loop(controller: Weak<StreamController>, device: Device) {
    loop {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        let now = Instant::now();
        let (heartbeat, expired, since_sent) = {
            let timing = controller.timing.lock().await;
            (
                timing.heartbeat,
                timing.expired(now),
                now.saturating_duration_since(timing.last_sent),
            )
        };

        if expired {
            log::info!(
                "controller {} missed {} heartbeats, expiring",
                controller,
                MISSED_HEARTBEAT_LIMIT
            );
            controller.retire(&device).await;
            break;
        }

        let delay = if since_sent >= heartbeat {
            let keep_alive = Message::KeepAlive(KeepAlive::from_duration(heartbeat));
            if let Err(e) = controller.send_message(keep_alive).await {
                log::warn!("controller {}: failed to send keepalive: {}", controller, e);
                break;
            }
            heartbeat
        } else {
            heartbeat - since_sent
        };
        drop(controller);
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl Controller for StreamController {
    fn id(&self) -> ControllerId {
        self.id
    }

    fn supports_lightweight(&self) -> bool {
        self.lightweight_socket.is_some()
    }

    async fn add_subscription(&self, subscription: Subscription) -> OcaResult<()> {
        self.subscriptions.lock().await.add(subscription)
    }

    async fn remove_subscription(&self, subscription: &Subscription) -> OcaResult<()> {
        self.subscriptions.lock().await.remove(subscription);
        Ok(())
    }

    async fn remove_matching_subscriptions(
        &self,
        event: Event,
        property: Option<PropertyID>,
        subscriber: Method,
    ) -> OcaResult<()> {
        self.subscriptions
            .lock()
            .await
            .remove_matching(event, property, subscriber);
        Ok(())
    }

    async fn notify_subscribers(&self, event: Event, event_data: &[u8]) -> OcaResult<()> {
        let deliveries = self.subscriptions.lock().await.notifications(event, event_data)?;
        for delivery in deliveries {
            match delivery.destination {
                Some(destination) => self.send_lightweight(delivery.message, &destination).await?,
                None => self.send_message(delivery.message).await?,
            }
        }
        Ok(())
    }

    async fn send_message(&self, message: Message) -> OcaResult<()> {
        self.batcher.enqueue(&message).await
    }

    async fn clear_subscriptions(&self) {
        self.subscriptions.lock().await.clear();
    }
}

impl fmt::Display for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream.peer_address() {
            Some(peer) => write!(f, "#{} ({})", self.id, peer),
            None => write!(f, "#{}", self.id),
        }
    }
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("batcher", &self.batcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oca_core::params::{AddSubscriptionParameters, property_changed_event};
    use oca_core::well_known::root;
    use oca_core::{Blob, MethodID, NotificationDeliveryMode};
    use oca_ocp1::{Command, MessageType, Parameters, send_messages};
    use oca_transport::StreamTransport;

    fn pair_with(config: &DeviceConfig) -> (StreamController, Arc<dyn StreamAccessor>) {
        let (device_side, peer_side) = tokio::io::duplex(4096);
        let stream: Arc<dyn StreamAccessor> = Arc::new(StreamTransport::from_stream(device_side));
        let peer: Arc<dyn StreamAccessor> = Arc::new(StreamTransport::from_stream(peer_side));
        (StreamController::new(1, stream, config), peer)
    }

    fn pair() -> (StreamController, Arc<dyn StreamAccessor>) {
        pair_with(&DeviceConfig::default())
    }

    fn level_changed(value: u8) -> Vec<u8> {
        oca_core::encode_value(&oca_core::params::PropertyChangedEventData {
            property_id: PropertyID::new(4, 1),
            property_value: value,
            change_type: oca_core::PropertyChangeType::CurrentChanged,
        })
        .unwrap()
    }

    fn subscription(delivery: NotificationDeliveryMode) -> Subscription {
        Subscription::Event(AddSubscriptionParameters {
            event: property_changed_event(4096),
            subscriber: Method::new(1055, MethodID::new(1, 1)),
            subscriber_context: Blob::default(),
            notification_delivery_mode: delivery,
            destination_information: Blob::default(),
        })
    }

    #[tokio::test]
    async fn test_command_gets_response() {
        let device = Device::new(DeviceConfig::default());
        let (controller, peer) = pair();
        let controller = Arc::new(controller);
        let task = tokio::spawn(controller.clone().run(device.clone()));

        let command = Command::new(77, 4, root::GET_ROLE, Parameters::default());
        send_messages(&*peer, &[Message::CommandRrq(command)], CodecOptions::LEGACY)
            .await
            .unwrap();
        let pdu = receive_pdu(&*peer, CodecOptions::LEGACY).await.unwrap();
        assert_eq!(pdu.message_type, MessageType::Response);
        match &pdu.messages[0] {
            Message::Response(response) => {
                assert_eq!(response.handle, 77);
                assert_eq!(response.status_code, OcaStatus::Ok);
                assert_eq!(response.parameters.decode::<String>().unwrap(), "Subscription Manager");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(device.controller_count().await, 1);

        peer.close().await.unwrap();
        task.await.unwrap();
        assert_eq!(device.controller_count().await, 0);
    }

    #[tokio::test]
    async fn test_lightweight_needs_socket() {
        let (controller, _peer) = pair();
        assert!(!controller.supports_lightweight());
        let err = controller
            .send_lightweight(
                Message::KeepAlive(KeepAlive::Seconds(1)),
                &Ocp1NetworkAddress::new("127.0.0.1", 9).to_network_address().unwrap(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), OcaStatus::ParameterError);
    }

    #[tokio::test]
    async fn test_lightweight_delivery() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let (controller, _peer) = pair();
        let controller = controller.with_lightweight_socket(socket);
        let mut params = match subscription(NotificationDeliveryMode::Lightweight) {
            Subscription::Event(params) => params,
            _ => unreachable!(),
        };
        params.destination_information =
            Ocp1NetworkAddress::new("127.0.0.1", port).to_network_address().unwrap();
        controller.add_subscription(Subscription::Event(params)).await.unwrap();

        controller
            .notify_subscribers(property_changed_event(4096), &level_changed(1))
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let n = receiver.recv(&mut buf).await.unwrap();
        let pdu = oca_ocp1::decode_pdu(&buf[..n], CodecOptions::LEGACY).unwrap();
        assert_eq!(pdu.message_type, MessageType::Notification1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_share_a_pdu() {
        let config = DeviceConfig::default().with_batching(None, Duration::from_millis(100));
        let (controller, peer) = pair_with(&config);
        controller
            .add_subscription(subscription(NotificationDeliveryMode::Normal))
            .await
            .unwrap();

        for value in [1, 2] {
            controller
                .notify_subscribers(property_changed_event(4096), &level_changed(value))
                .await
                .unwrap();
        }

        // flushed together once the batch threshold elapses
        let pdu = receive_pdu(&*peer, CodecOptions::LEGACY).await.unwrap();
        assert_eq!(pdu.message_type, MessageType::Notification1);
        assert_eq!(pdu.messages.len(), 2);
        match &pdu.messages[1] {
            Message::Notification1(notification) => {
                assert_eq!(notification.event, property_changed_event(4096));
                assert_eq!(notification.event_data, level_changed(2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_subscription() {
        let (controller, _peer) = pair();
        let s = subscription(NotificationDeliveryMode::Normal);
        controller.add_subscription(s.clone()).await.unwrap();
        assert!(matches!(
            controller.add_subscription(s.clone()).await,
            Err(OcaError::AlreadySubscribedToEvent)
        ));
        controller.remove_subscription(&s).await.unwrap();
        assert_eq!(controller.subscription_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_and_expiry() {
        let device = Device::new(DeviceConfig::default());
        let (controller, peer) = pair();
        let controller = Arc::new(controller);
        let task = tokio::spawn(controller.clone().run(device.clone()));

        send_messages(
            &*peer,
            &[Message::KeepAlive(KeepAlive::Seconds(1))],
            CodecOptions::LEGACY,
        )
        .await
        .unwrap();

        // the device answers with its own keepalive within one heartbeat
        let pdu = receive_pdu(&*peer, CodecOptions::LEGACY).await.unwrap();
        assert_eq!(pdu.message_type, MessageType::KeepAlive);
        assert_eq!(controller.heartbeat().await, Duration::from_secs(1));

        // then the controller falls silent for more than three heartbeats
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(device.controller_count().await, 0);
        assert_eq!(controller.subscription_count().await, 0);

        peer.close().await.unwrap();
        task.await.unwrap();
    }
}
