//! OCP.1 PDU framing
//!
//! A PDU is a 10-byte header followed by `message_count` messages of one
//! type:
//!
//! ```text
//! sync(1) = 0x3B | version(2) = 1 | pdu_size(4) | type(1) | count(2) | messages...
//! ```
//!
//! `pdu_size` counts every byte after the sync byte.

use crate::message::{CodecOptions, Message, MessageType};
use bytes::{BufMut, Bytes, BytesMut};
use oca_core::{OcaError, OcaResult};
use oca_transport::StreamAccessor;

/// First byte of every PDU
pub const SYNC_VALUE: u8 = 0x3B;
/// OCP.1 protocol version
pub const PROTOCOL_VERSION: u16 = 1;
/// Sync byte plus header fields
pub const HEADER_SIZE: usize = 10;
/// Sync, version and size: enough to learn how much more to read
pub const MINIMUM_PDU_SIZE: usize = 7;
/// Smallest legal `pdu_size` value (a header without messages)
pub const MINIMUM_PDU_SIZE_FIELD: u32 = (HEADER_SIZE - 1) as u32;
/// Largest PDU accepted from a byte stream
pub const MAXIMUM_PDU_SIZE: u32 = 16 * 1024 * 1024;

/// Decoded PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol_version: u16,
    pub pdu_size: u32,
    pub pdu_type: MessageType,
    pub message_count: u16,
}

impl Header {
    /// Total length of the PDU on the wire, sync byte included
    pub fn pdu_length(&self) -> usize {
        self.pdu_size as usize + 1
    }
}

/// One decoded PDU: messages of a single type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub message_type: MessageType,
    pub messages: Vec<Message>,
}

/// Validate sync byte and minimum length, then read the header fields
pub fn decode_header(bytes: &[u8]) -> OcaResult<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(OcaError::PduTooShort);
    }
    if bytes[0] != SYNC_VALUE {
        return Err(OcaError::InvalidSyncValue(bytes[0]));
    }
    let protocol_version = u16::from_be_bytes([bytes[1], bytes[2]]);
    if protocol_version != PROTOCOL_VERSION {
        return Err(OcaError::InvalidProtocolVersion(protocol_version));
    }
    let pdu_size = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    if pdu_size < MINIMUM_PDU_SIZE_FIELD {
        return Err(OcaError::InvalidPduSize);
    }
    let pdu_type = MessageType::try_from(bytes[7])?;
    let message_count = u16::from_be_bytes([bytes[8], bytes[9]]);

    Ok(Header {
        protocol_version,
        pdu_size,
        pdu_type,
        message_count,
    })
}

/// Split the message area of a PDU into per-message slices
fn split_messages<'a>(header: &Header, body: &'a [u8]) -> OcaResult<Vec<&'a [u8]>> {
    if header.pdu_type == MessageType::KeepAlive {
        if header.message_count != 1 {
            return Err(OcaError::InvalidKeepAlivePdu);
        }
        return Ok(vec![body]);
    }

    let mut slices = Vec::with_capacity(usize::from(header.message_count));
    let mut rest = body;
    for _ in 0..header.message_count {
        if rest.len() < 4 {
            return Err(OcaError::InvalidMessageSize);
        }
        let size = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if size < 4 || size > rest.len() {
            return Err(OcaError::InvalidMessageSize);
        }
        let (message, tail) = rest.split_at(size);
        slices.push(message);
        rest = tail;
    }
    if !rest.is_empty() {
        log::debug!("{} trailing bytes after last message ignored", rest.len());
    }
    Ok(slices)
}

/// Decode one complete PDU
///
/// Bytes past the declared PDU length are ignored; call
/// [`Header::pdu_length`] on the header to walk a buffer of several PDUs.
pub fn decode_pdu(bytes: &[u8], options: CodecOptions) -> OcaResult<Pdu> {
    let header = decode_header(bytes)?;
    if bytes.len() < header.pdu_length() {
        return Err(OcaError::PduTooShort);
    }
    let body = &bytes[HEADER_SIZE..header.pdu_length()];
    let messages = split_messages(&header, body)?
        .into_iter()
        .map(|message| Message::decode(message, header.pdu_type, options))
        .collect::<OcaResult<Vec<_>>>()?;

    Ok(Pdu {
        message_type: header.pdu_type,
        messages,
    })
}

/// Decode every PDU in a datagram
pub fn decode_datagram(mut bytes: &[u8], options: CodecOptions) -> OcaResult<Vec<Pdu>> {
    let mut pdus = Vec::new();
    while !bytes.is_empty() {
        let header = decode_header(bytes)?;
        let length = header.pdu_length();
        if bytes.len() < length {
            return Err(OcaError::PduTooShort);
        }
        pdus.push(decode_pdu(&bytes[..length], options)?);
        bytes = &bytes[length..];
    }
    Ok(pdus)
}

/// Wrap already-encoded messages of one type in a PDU header
pub fn frame_messages(
    message_type: MessageType,
    encoded: &[impl AsRef<[u8]>],
) -> OcaResult<Bytes> {
    let message_count = u16::try_from(encoded.len()).map_err(|_| OcaError::InvalidMessageSize)?;
    if message_type == MessageType::KeepAlive && message_count != 1 {
        return Err(OcaError::InvalidKeepAlivePdu);
    }
    let body_size: usize = encoded.iter().map(|m| m.as_ref().len()).sum();
    let pdu_size =
        u32::try_from(HEADER_SIZE - 1 + body_size).map_err(|_| OcaError::InvalidPduSize)?;

    let mut buffer = BytesMut::with_capacity(HEADER_SIZE + body_size);
    buffer.put_u8(SYNC_VALUE);
    buffer.put_u16(PROTOCOL_VERSION);
    buffer.put_u32(pdu_size);
    buffer.put_u8(message_type as u8);
    buffer.put_u16(message_count);
    for message in encoded {
        buffer.put_slice(message.as_ref());
    }
    Ok(buffer.freeze())
}

/// Encode messages into a single PDU
///
/// All messages must share one type; a KeepAlive PDU carries exactly one.
pub fn encode_pdu(messages: &[Message], options: CodecOptions) -> OcaResult<Bytes> {
    let message_type = messages
        .first()
        .map(Message::message_type)
        .ok_or(OcaError::InvalidMessageSize)?;
    if messages.iter().any(|m| m.message_type() != message_type) {
        return Err(OcaError::InvalidData(
            "messages of one PDU must share a type".to_string(),
        ));
    }
    let encoded = messages
        .iter()
        .map(|m| m.encode(options))
        .collect::<OcaResult<Vec<_>>>()?;
    frame_messages(message_type, &encoded)
}

/// Read one PDU from a transport
///
/// On a byte stream the fixed prefix is read first to learn the PDU size; a
/// framing error there cannot be recovered. On a datagram transport the next
/// datagram is read and must hold exactly one PDU.
pub async fn receive_pdu(stream: &dyn StreamAccessor, options: CodecOptions) -> OcaResult<Pdu> {
    if stream.is_datagram() {
        let datagram = stream.receive_datagram().await?;
        return decode_pdu(&datagram, options);
    }

    let mut bytes = stream.read_exact(MINIMUM_PDU_SIZE).await?;
    if bytes[0] != SYNC_VALUE {
        return Err(OcaError::InvalidSyncValue(bytes[0]));
    }
    let pdu_size = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    if !(MINIMUM_PDU_SIZE_FIELD..=MAXIMUM_PDU_SIZE).contains(&pdu_size) {
        return Err(OcaError::InvalidPduSize);
    }
    let remaining = pdu_size as usize - (MINIMUM_PDU_SIZE - 1);
    bytes.extend_from_slice(&stream.read_exact(remaining).await?);
    log::trace!("received PDU of {} bytes", bytes.len());
    decode_pdu(&bytes, options)
}

/// Encode and write messages as one PDU
pub async fn send_messages(
    stream: &dyn StreamAccessor,
    messages: &[Message],
    options: CodecOptions,
) -> OcaResult<()> {
    let pdu = encode_pdu(messages, options)?;
    log::trace!("sending {:?} PDU of {} bytes", messages[0].message_type(), pdu.len());
    stream.write_all(&pdu).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, KeepAlive, Parameters, Response};
    use oca_core::{MethodID, OcaStatus};
    use oca_transport::StreamTransport;

    const SCENARIO_PDU: [u8; 27] = [
        0x3B, 0x00, 0x01, 0x00, 0x00, 0x00, 0x1A, 0x01, 0x00, 0x01, // header
        0x00, 0x00, 0x00, 0x11, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x10, 0x00, 0x00, 0x01,
        0x00, 0x01, 0x00,
    ];

    fn get_class_command(handle: u32) -> Message {
        Message::CommandRrq(Command::new(
            handle,
            0x1000,
            MethodID::new(1, 1),
            Parameters::default(),
        ))
    }

    #[test]
    fn test_encode_command_pdu() {
        let pdu = encode_pdu(&[get_class_command(7)], CodecOptions::LEGACY).unwrap();
        assert_eq!(&pdu[..], &SCENARIO_PDU[..]);
    }

    #[test]
    fn test_decode_command_pdu() {
        let pdu = decode_pdu(&SCENARIO_PDU, CodecOptions::LEGACY).unwrap();
        assert_eq!(pdu.message_type, MessageType::CommandRrq);
        assert_eq!(pdu.messages, vec![get_class_command(7)]);
    }

    #[test]
    fn test_decode_header_errors() {
        assert!(matches!(decode_header(&SCENARIO_PDU[..9]), Err(OcaError::PduTooShort)));

        let mut bad = SCENARIO_PDU;
        bad[0] = 0x3C;
        assert!(matches!(decode_header(&bad), Err(OcaError::InvalidSyncValue(0x3C))));

        let mut bad = SCENARIO_PDU;
        bad[2] = 2;
        assert!(matches!(decode_header(&bad), Err(OcaError::InvalidProtocolVersion(2))));

        let mut bad = SCENARIO_PDU;
        bad[6] = 8;
        assert!(matches!(decode_header(&bad), Err(OcaError::InvalidPduSize)));

        let mut bad = SCENARIO_PDU;
        bad[7] = 9;
        assert!(matches!(decode_header(&bad), Err(OcaError::InvalidMessageType(9))));
    }

    #[test]
    fn test_decode_truncated_pdu() {
        assert!(matches!(
            decode_pdu(&SCENARIO_PDU[..20], CodecOptions::LEGACY),
            Err(OcaError::PduTooShort)
        ));
    }

    #[test]
    fn test_decode_bad_message_size() {
        let mut bad = SCENARIO_PDU;
        bad[13] = 0x20;
        assert!(matches!(
            decode_pdu(&bad, CodecOptions::LEGACY),
            Err(OcaError::InvalidMessageSize)
        ));

        let mut bad = SCENARIO_PDU;
        bad[13] = 0x02;
        assert!(matches!(
            decode_pdu(&bad, CodecOptions::LEGACY),
            Err(OcaError::InvalidMessageSize)
        ));
    }

    #[test]
    fn test_multiple_messages() {
        let messages = vec![
            Message::Response(Response::status(100, OcaStatus::Ok)),
            Message::Response(Response::new(101, OcaStatus::Ok, Parameters::new(1, vec![7]))),
            Message::Response(Response::status(102, OcaStatus::Locked)),
        ];
        let bytes = encode_pdu(&messages, CodecOptions::LEGACY).unwrap();
        let header = decode_header(&bytes).unwrap();
        assert_eq!(header.message_count, 3);
        assert_eq!(header.pdu_length(), bytes.len());

        let pdu = decode_pdu(&bytes, CodecOptions::LEGACY).unwrap();
        assert_eq!(pdu.messages, messages);
    }

    #[test]
    fn test_mixed_types_rejected() {
        let messages = vec![
            get_class_command(1),
            Message::Response(Response::status(1, OcaStatus::Ok)),
        ];
        assert!(encode_pdu(&messages, CodecOptions::LEGACY).is_err());
        assert!(encode_pdu(&[], CodecOptions::LEGACY).is_err());
    }

    #[test]
    fn test_keepalive_pdu() {
        let keep_alive = Message::KeepAlive(KeepAlive::Seconds(1));
        let bytes = encode_pdu(&[keep_alive.clone()], CodecOptions::LEGACY).unwrap();
        assert_eq!(&bytes[..], &[0x3B, 0, 1, 0, 0, 0, 11, 3, 0, 1, 0, 1]);
        let pdu = decode_pdu(&bytes, CodecOptions::LEGACY).unwrap();
        assert_eq!(pdu.messages, vec![keep_alive.clone()]);

        assert!(matches!(
            encode_pdu(&[keep_alive.clone(), keep_alive], CodecOptions::LEGACY),
            Err(OcaError::InvalidKeepAlivePdu)
        ));

        let bad = [0x3B, 0, 1, 0, 0, 0, 12, 3, 0, 1, 0, 1, 2];
        assert!(matches!(
            decode_pdu(&bad, CodecOptions::LEGACY),
            Err(OcaError::InvalidKeepAlivePdu)
        ));
    }

    #[test]
    fn test_decode_datagram_with_two_pdus() {
        let mut datagram = SCENARIO_PDU.to_vec();
        datagram.extend_from_slice(
            &encode_pdu(&[Message::KeepAlive(KeepAlive::Milliseconds(500))], CodecOptions::LEGACY)
                .unwrap(),
        );
        let pdus = decode_datagram(&datagram, CodecOptions::LEGACY).unwrap();
        assert_eq!(pdus.len(), 2);
        assert_eq!(pdus[1].message_type, MessageType::KeepAlive);
    }

    #[tokio::test]
    async fn test_receive_pdu_from_stream() {
        let mock = tokio_test::io::Builder::new()
            .read(&SCENARIO_PDU[..4])
            .read(&SCENARIO_PDU[4..])
            .build();
        let stream = StreamTransport::from_stream(mock);
        let pdu = receive_pdu(&stream, CodecOptions::LEGACY).await.unwrap();
        assert_eq!(pdu.messages, vec![get_class_command(7)]);
    }

    #[tokio::test]
    async fn test_receive_pdu_bad_sync() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x00, 0, 1, 0, 0, 0, 9])
            .build();
        let stream = StreamTransport::from_stream(mock);
        assert!(matches!(
            receive_pdu(&stream, CodecOptions::LEGACY).await,
            Err(OcaError::InvalidSyncValue(0))
        ));
    }

    #[tokio::test]
    async fn test_send_messages_writes_pdu() {
        let mock = tokio_test::io::Builder::new().write(&SCENARIO_PDU).build();
        let stream = StreamTransport::from_stream(mock);
        send_messages(&stream, &[get_class_command(7)], CodecOptions::LEGACY)
            .await
            .unwrap();
    }
}
