//! Outgoing message batching
//!
//! The batcher collects encoded messages of one type and writes them as a
//! single PDU, either when a message of another type arrives, when the next
//! message would not fit in the batch size, or when the dequeue interval
//! elapses after the first message of a batch was queued.

use crate::message::{CodecOptions, Message, MessageType};
use crate::pdu::{HEADER_SIZE, frame_messages};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use oca_core::OcaResult;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Destination of framed PDUs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PduSink: Send + Sync {
    async fn send_pdu(&self, pdu: Bytes) -> OcaResult<()>;
}

/// Batch size used when none is configured
///
/// A datagram transport is limited to one Ethernet frame; a stream to the
/// largest size a 16-bit length allows.
pub fn default_batch_size(is_datagram: bool) -> usize {
    if is_datagram {
        oca_transport::UDP_BATCH_SIZE
    } else {
        usize::from(u16::MAX)
    }
}

/// Dequeue interval used when none is configured: a hundredth of the
/// heartbeat, but at least 10ms
pub fn default_dequeue_interval(heartbeat: Duration) -> Duration {
    let interval = heartbeat / 100;
    if interval.is_zero() {
        Duration::from_millis(10)
    } else {
        interval
    }
}

#[derive(Debug, Default)]
struct BatchState {
    encoded: Vec<BytesMut>,
    message_type: Option<MessageType>,
    periodic: Option<JoinHandle<()>>,
}

impl BatchState {
    fn size(&self) -> usize {
        HEADER_SIZE + self.encoded.iter().map(BytesMut::len).sum::<usize>()
    }
}

struct BatcherInner {
    batch_size: usize,
    dequeue_interval: Duration,
    options: CodecOptions,
    sink: Arc<dyn PduSink>,
    state: Mutex<BatchState>,
}

impl Drop for BatcherInner {
    fn drop(&mut self) {
        if let Some(periodic) = self.state.get_mut().periodic.take() {
            periodic.abort();
        }
    }
}

impl BatcherInner {
    /// Send the pending batch, leaving the state empty
    ///
    /// The state lock stays held while the PDU is written so batches leave in
    /// the order they were assembled.
    async fn flush(&self, state: &mut BatchState, stop_timer: bool) -> OcaResult<()> {
        if let Some(periodic) = state.periodic.take() {
            if stop_timer {
                periodic.abort();
            }
        }

        let Some(message_type) = state.message_type.take() else {
            return Ok(());
        };
        let encoded = std::mem::take(&mut state.encoded);
        if encoded.is_empty() {
            return Ok(());
        }

        log::trace!("flushing {} {:?} messages", encoded.len(), message_type);
        let pdu = frame_messages(message_type, &encoded)?;
        self.sink.send_pdu(pdu).await
    }
}

/// Coalesces outgoing messages of the same type into fewer PDUs
pub struct MessageBatcher {
    inner: Arc<BatcherInner>,
}

impl MessageBatcher {
    /// Create a batcher
    ///
    /// A zero `dequeue_interval` disables batching: every message is sent in
    /// its own PDU as soon as it is enqueued.
    pub fn new(
        batch_size: usize,
        dequeue_interval: Duration,
        options: CodecOptions,
        sink: Arc<dyn PduSink>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                batch_size,
                dequeue_interval,
                options,
                sink,
                state: Mutex::new(BatchState::default()),
            }),
        }
    }

    /// A batcher that sends every message immediately
    pub fn unbatched(options: CodecOptions, sink: Arc<dyn PduSink>) -> Self {
        Self::new(1, Duration::ZERO, options, sink)
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub fn dequeue_interval(&self) -> Duration {
        self.inner.dequeue_interval
    }

    /// Number of messages waiting in the current batch
    pub async fn current_count(&self) -> usize {
        self.inner.state.lock().await.encoded.len()
    }

    /// Encoded size of the current batch, header included
    pub async fn current_size(&self) -> usize {
        self.inner.state.lock().await.size()
    }

    /// Queue one message, flushing the pending batch first if it cannot be combined
    ///
    /// When that flush fails the pending batch is dropped, but `message`
    /// still starts the next batch.
    ///
    /// # Errors
    /// Encoding errors of `message`, and send errors of any flush this call triggers
    pub async fn enqueue(&self, message: &Message) -> OcaResult<()> {
        let message_type = message.message_type();
        let encoded = message.encode(self.inner.options)?;

        if self.inner.dequeue_interval.is_zero() {
            let pdu = frame_messages(message_type, &[encoded])?;
            return self.inner.sink.send_pdu(pdu).await;
        }

        let mut state = self.inner.state.lock().await;
        let can_combine = message_type != MessageType::KeepAlive
            && state.message_type == Some(message_type)
            && state.encoded.len() < usize::from(u16::MAX)
            && state.size() + encoded.len() <= self.inner.batch_size;
        let flushed = if can_combine {
            Ok(())
        } else {
            self.inner.flush(&mut state, true).await
        };

        state.encoded.push(encoded);
        state.message_type = Some(message_type);
        if state.encoded.len() == 1 {
            self.start_periodic_dequeue(&mut state);
        }
        flushed
    }

    fn start_periodic_dequeue(&self, state: &mut BatchState) {
        if state.periodic.is_some() {
            return;
        }
        let weak: Weak<BatcherInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.dequeue_interval;
        state.periodic = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            // this task is the timer; it must not abort itself
            if let Err(e) = inner.flush(&mut state, false).await {
                log::error!("periodic batch flush failed: {}", e);
            }
        }));
    }

    /// Send the pending batch now
    ///
    /// Does nothing when the batch is empty.
    pub async fn dequeue(&self) -> OcaResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.flush(&mut state, true).await
    }
}

impl std::fmt::Debug for MessageBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBatcher")
            .field("batch_size", &self.inner.batch_size)
            .field("dequeue_interval", &self.inner.dequeue_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, KeepAlive, Parameters, Response};
    use crate::pdu::{decode_header, decode_pdu};
    use oca_core::{MethodID, OcaError, OcaStatus};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<Bytes>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PduSink for RecordingSink {
        async fn send_pdu(&self, pdu: Bytes) -> OcaResult<()> {
            self.sent.lock().unwrap().push(pdu);
            Ok(())
        }
    }

    fn command(handle: u32) -> Message {
        Message::Command(Command::new(
            handle,
            4096,
            MethodID::new(4, 2),
            Parameters::new(1, vec![0, 0, 0, 1]),
        ))
    }

    fn response(handle: u32) -> Message {
        Message::Response(Response::status(handle, OcaStatus::Ok))
    }

    fn batcher(sink: Arc<dyn PduSink>, batch_size: usize) -> MessageBatcher {
        MessageBatcher::new(
            batch_size,
            Duration::from_secs(1),
            CodecOptions::LEGACY,
            sink,
        )
    }

    #[tokio::test]
    async fn test_type_change_flushes_once() {
        let mut sink = MockPduSink::new();
        sink.expect_send_pdu()
            .withf(|pdu| {
                let header = decode_header(pdu).unwrap();
                header.pdu_type == MessageType::Command && header.message_count == 2
            })
            .times(1)
            .returning(|_| Ok(()));
        let batcher = batcher(Arc::new(sink), 1000);

        batcher.enqueue(&command(100)).await.unwrap();
        batcher.enqueue(&command(101)).await.unwrap();
        assert_eq!(batcher.current_count().await, 2);
        batcher.enqueue(&response(5)).await.unwrap();
        assert_eq!(batcher.current_count().await, 1);
    }

    #[tokio::test]
    async fn test_dequeue_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = batcher(sink.clone(), 1000);

        batcher.dequeue().await.unwrap();
        assert!(sink.sent().is_empty());

        batcher.enqueue(&command(1)).await.unwrap();
        batcher.dequeue().await.unwrap();
        batcher.dequeue().await.unwrap();
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(batcher.current_count().await, 0);
    }

    #[tokio::test]
    async fn test_size_limit_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let one = command(1).encode(CodecOptions::LEGACY).unwrap().len();
        // room for exactly two messages
        let batcher = batcher(sink.clone(), HEADER_SIZE + 2 * one);

        batcher.enqueue(&command(1)).await.unwrap();
        batcher.enqueue(&command(2)).await.unwrap();
        assert!(sink.sent().is_empty());
        assert_eq!(batcher.current_size().await, HEADER_SIZE + 2 * one);

        batcher.enqueue(&command(3)).await.unwrap();
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].len() <= batcher.batch_size());
        let pdu = decode_pdu(&sent[0], CodecOptions::LEGACY).unwrap();
        assert_eq!(pdu.messages, vec![command(1), command(2)]);
    }

    #[tokio::test]
    async fn test_keepalive_never_combined() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = batcher(sink.clone(), 1000);
        let keep_alive = Message::KeepAlive(KeepAlive::Seconds(1));

        batcher.enqueue(&keep_alive).await.unwrap();
        assert!(sink.sent().is_empty());
        batcher.enqueue(&keep_alive).await.unwrap();
        assert_eq!(sink.sent().len(), 1);
        batcher.dequeue().await.unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        for pdu in sent {
            assert_eq!(decode_header(&pdu).unwrap().message_count, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = batcher(sink.clone(), 1000);

        batcher.enqueue(&command(1)).await.unwrap();
        batcher.enqueue(&command(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sink.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(batcher.current_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_sends_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::unbatched(CodecOptions::LEGACY, sink.clone());

        batcher.enqueue(&command(1)).await.unwrap();
        batcher.enqueue(&command(2)).await.unwrap();
        assert_eq!(sink.sent().len(), 2);
        assert_eq!(batcher.current_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_error_propagates_to_trigger() {
        let mut sink = MockPduSink::new();
        let mut sends = 0;
        sink.expect_send_pdu().times(2).returning(move |pdu| {
            sends += 1;
            if sends == 1 {
                return Err(OcaError::PduSendingFailed);
            }
            let pdu = decode_pdu(&pdu, CodecOptions::LEGACY).unwrap();
            assert_eq!(pdu.messages, vec![response(1)]);
            Ok(())
        });
        let batcher = batcher(Arc::new(sink), 1000);

        batcher.enqueue(&command(1)).await.unwrap();
        assert!(matches!(
            batcher.enqueue(&response(1)).await,
            Err(OcaError::PduSendingFailed)
        ));
        // the failed batch is dropped, not retried; the trigger stays queued
        assert_eq!(batcher.current_count().await, 1);
        batcher.dequeue().await.unwrap();
        assert_eq!(batcher.current_count().await, 0);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_batch_size(true), 1472);
        assert_eq!(default_batch_size(false), 65535);
        assert_eq!(
            default_dequeue_interval(Duration::from_secs(1)),
            Duration::from_millis(10)
        );
        assert_eq!(
            default_dequeue_interval(Duration::from_secs(5)),
            Duration::from_millis(50)
        );
        assert_eq!(
            default_dequeue_interval(Duration::ZERO),
            Duration::from_millis(10)
        );
    }
}
