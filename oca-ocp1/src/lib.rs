//! OCP.1 wire protocol
//!
//! Message bodies, PDU framing and outgoing message batching shared by the
//! controller and device roles.

pub mod batcher;
pub mod message;
pub mod pdu;

pub use batcher::{MessageBatcher, PduSink, default_batch_size, default_dequeue_interval};
pub use message::{
    CodecOptions, Command, Extension, KeepAlive, Message, MessageType, Notification1,
    Notification2, Notification2Type, Parameters, Response, check_parameter_count,
};
pub use pdu::{
    HEADER_SIZE, Header, PROTOCOL_VERSION, Pdu, SYNC_VALUE, decode_datagram, decode_header,
    decode_pdu, encode_pdu, frame_messages, receive_pdu, send_messages,
};
