//! Connection monitor
//!
//! One task per link reads PDUs in arrival order, resolves pending commands by
//! handle, routes notifications to event subscribers and keeps the heartbeat
//! going. The task ends with the error that took the link down.

use crate::connection::{Connection, ConnectionInner};
use oca_core::{OcaError, OcaResult};
use oca_ocp1::{
    CodecOptions, KeepAlive, Message, MessageBatcher, Pdu, Response,
    decode_datagram, receive_pdu,
};
use oca_transport::StreamAccessor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// First handle a connection allocates
pub const FIRST_HANDLE: u32 = 100;

/// Heartbeats of silence after which the device is considered gone
pub const MISSED_KEEPALIVE_LIMIT: u32 = 3;

const MINIMUM_KEEPALIVE_SLEEP: Duration = Duration::from_millis(100);

type ResponseSender = oneshot::Sender<OcaResult<Response>>;

struct PendingTable {
    next_handle: u32,
    waiting: HashMap<u32, ResponseSender>,
}

/// Commands waiting for their Response
pub(crate) struct PendingRequests {
    table: Mutex<PendingTable>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(PendingTable {
                next_handle: FIRST_HANDLE,
                waiting: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_free(table: &mut PendingTable) -> u32 {
        loop {
            let handle = table.next_handle;
            table.next_handle = handle.checked_add(1).unwrap_or(FIRST_HANDLE);
            if !table.waiting.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Allocate a handle for a command that gets no Response
    pub(crate) fn allocate(&self) -> u32 {
        Self::next_free(&mut self.lock())
    }

    /// Allocate a handle no outstanding command uses and wait on it
    pub(crate) fn register(&self) -> (u32, oneshot::Receiver<OcaResult<Response>>) {
        let (sender, receiver) = oneshot::channel();
        let mut table = self.lock();
        let handle = Self::next_free(&mut table);
        table.waiting.insert(handle, sender);
        (handle, receiver)
    }

    /// Hand a Response to the command waiting on its handle
    ///
    /// # Errors
    /// `InvalidHandle` when no command waits on the handle
    pub(crate) fn resolve(&self, response: Response) -> OcaResult<()> {
        let handle = response.handle;
        let Some(sender) = self.lock().waiting.remove(&handle) else {
            return Err(OcaError::InvalidHandle(handle));
        };
        // the caller may have given up in the meantime
        let _ = sender.send(Ok(response));
        Ok(())
    }

    pub(crate) fn cancel(&self, handle: u32) {
        self.lock().waiting.remove(&handle);
    }

    /// Fail every waiting command with `error`
    pub(crate) fn fail_all(&self, error: &OcaError) {
        let waiting: Vec<ResponseSender> = self.lock().waiting.drain().map(|(_, s)| s).collect();
        if !waiting.is_empty() {
            log::debug!("failing {} outstanding commands: {}", waiting.len(), error);
        }
        for sender in waiting {
            let _ = sender.send(Err(error.replay()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiting.len()
    }
}

/// Drops the pending entry of a command when its caller stops waiting
pub(crate) struct PendingGuard<'a> {
    pub(crate) pending: &'a PendingRequests,
    pub(crate) handle: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.handle);
    }
}

/// Send and receive timestamps of a link
pub(crate) struct Activity {
    last_sent: Mutex<Instant>,
    last_received: Mutex<Instant>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            last_sent: Mutex::new(now),
            last_received: Mutex::new(now),
        }
    }

    pub(crate) fn sent(&self) {
        *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn received(&self) {
        *self.last_received.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_sent(&self) -> Instant {
        *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_received(&self) -> Instant {
        *self.last_received.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything the monitor task of one link needs
pub(crate) struct LinkMonitor {
    pub(crate) link_id: u64,
    pub(crate) connection: Weak<ConnectionInner>,
    pub(crate) stream: Arc<dyn StreamAccessor>,
    pub(crate) batcher: Arc<MessageBatcher>,
    pub(crate) activity: Arc<Activity>,
    pub(crate) heartbeat: Duration,
    pub(crate) options: CodecOptions,
}

impl LinkMonitor {
    /// Run until the link fails, then report the failure to the connection
    pub(crate) async fn run(self) {
        let result = tokio::select! {
            result = self.receive_loop() => result,
            result = self.keep_alive_loop() => result,
        };
        let Err(error) = result else {
            return;
        };
        if let Some(inner) = self.connection.upgrade() {
            Connection::from_inner(inner)
                .monitor_failed(self.link_id, error)
                .await;
        }
    }

    async fn receive_loop(&self) -> OcaResult<()> {
        loop {
            let pdus = self.receive().await?;
            // the connection was dropped; nothing is left to deliver to
            let Some(inner) = self.connection.upgrade() else {
                return Ok(());
            };
            self.activity.received();
            if self.stream.is_datagram() {
                inner.mark_connected();
            }
            for pdu in pdus {
                log::trace!(
                    "received {} {:?} messages",
                    pdu.messages.len(),
                    pdu.message_type
                );
                for message in pdu.messages {
                    process_message(&inner, message).await;
                }
            }
        }
    }

    async fn receive(&self) -> OcaResult<Vec<Pdu>> {
        if !self.stream.is_datagram() {
            return Ok(vec![receive_pdu(&*self.stream, self.options).await?]);
        }
        loop {
            let datagram = self.stream.receive_datagram().await?;
            match decode_datagram(&datagram, self.options) {
                Ok(pdus) => return Ok(pdus),
                // a bad datagram does not affect the ones after it
                Err(e) if e.is_decode_error() => {
                    log::warn!("dropping undecodable datagram: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn keep_alive_loop(&self) -> OcaResult<()> {
        if self.heartbeat.is_zero() {
            return std::future::pending().await;
        }
        let limit = self.heartbeat * MISSED_KEEPALIVE_LIMIT;
        loop {
            let now = Instant::now();
            if now.duration_since(self.activity.last_received()) >= limit {
                log::warn!("no traffic from device for {:?}", limit);
                return Err(OcaError::MissingKeepalive);
            }

            let idle = now.duration_since(self.activity.last_sent());
            let sleep = if idle >= self.heartbeat {
                self.batcher
                    .enqueue(&Message::KeepAlive(KeepAlive::from_duration(self.heartbeat)))
                    .await?;
                self.heartbeat
            } else {
                self.heartbeat - idle
            };
            tokio::time::sleep(sleep.max(MINIMUM_KEEPALIVE_SLEEP)).await;
        }
    }
}

/// Apply one received message to the connection
pub(crate) async fn process_message(inner: &ConnectionInner, message: Message) {
    match message {
        Message::Response(response) => {
            if let Err(e) = inner.pending.resolve(response) {
                log::warn!("dropping response: {}", e);
            }
        }
        Message::Notification1(notification) => {
            if !notification.has_event_parameters() {
                return;
            }
            inner
                .deliver_event(notification.event, Ok(&notification.event_data))
                .await;
        }
        Message::Notification2(notification) => match notification.check_exception() {
            Ok(()) => {
                inner
                    .deliver_event(notification.event, Ok(&notification.data))
                    .await;
            }
            Err(e) => {
                log::warn!("exception for event {}: {}", notification.event, e);
                inner.deliver_event(notification.event, Err(&e)).await;
            }
        },
        Message::KeepAlive(keep_alive) => {
            log::trace!("keepalive from device: {:?}", keep_alive.heartbeat());
        }
        Message::Command(command) | Message::CommandRrq(command) => {
            log::warn!(
                "ignoring command {} for {} sent by device",
                command.method_id,
                command.target_ono
            );
        }
    }
}
