//! OCP.1 message bodies
//!
//! Each message kind knows how to write itself after its `u32` size field and
//! how to read itself back from a slice that starts at the size field. The
//! size is never stored: the PDU encoder measures what was written and
//! patches the field afterwards.

use bytes::{BufMut, BytesMut};
use oca_core::{
    Blob, Event, MethodID, NotificationException, ONo, OcaError, OcaResult, OcaStatus,
    Ocp1Decoder, Ocp1Encoder, WireDecode, WireEncode,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message kind carried in the PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Command = 0,
    CommandRrq = 1,
    Response = 2,
    KeepAlive = 3,
    Notification1 = 4,
    Notification2 = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = OcaError;

    fn try_from(value: u8) -> OcaResult<Self> {
        Ok(match value {
            0 => Self::Command,
            1 => Self::CommandRrq,
            2 => Self::Response,
            3 => Self::KeepAlive,
            4 => Self::Notification1,
            5 => Self::Notification2,
            other => return Err(OcaError::InvalidMessageType(other)),
        })
    }
}

/// Codec capabilities negotiated for a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecOptions {
    /// Commands and responses carry an extension block before their parameters
    pub extensions: bool,
}

impl CodecOptions {
    /// Legacy layout without extension blocks
    pub const LEGACY: Self = Self { extensions: false };
    /// Extension-aware layout
    pub const EXTENDED: Self = Self { extensions: true };
}

/// Parameter count plus opaque parameter bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    pub parameter_count: u8,
    pub parameter_data: Vec<u8>,
}

impl Parameters {
    pub fn new(parameter_count: u8, parameter_data: Vec<u8>) -> Self {
        Self {
            parameter_count,
            parameter_data,
        }
    }

    /// Encode `value` as the parameter data of `parameter_count` parameters
    pub fn from_value<T: WireEncode + ?Sized>(parameter_count: u8, value: &T) -> OcaResult<Self> {
        Ok(Self::new(parameter_count, oca_core::encode_value(value)?))
    }

    /// Decode the parameter data as `T`
    pub fn decode<T: WireDecode>(&self) -> OcaResult<T> {
        oca_core::decode_value(&self.parameter_data)
    }

    /// Log when the declared parameter count differs from what the caller expects
    ///
    /// A mismatch is reported, not rejected; the decoded shape is what counts.
    ///
    /// # Returns
    /// Whether the declared count matches
    pub fn check_count(&self, expected: u8, context: &str) -> bool {
        check_parameter_count(self.parameter_count, expected, context)
    }

    /// Decode the result of a method call that returns `expected` parameters
    ///
    /// # Arguments
    /// * `expected` - Parameter count of the method's result
    /// * `context` - Names the call in the diagnostic of a count mismatch
    ///
    /// # Errors
    /// `InvalidProxyMethodResponse` when the parameter data does not decode
    /// as `T`
    pub fn decode_result<T: WireDecode>(&self, expected: u8, context: &str) -> OcaResult<T> {
        self.check_count(expected, context);
        self.decode().map_err(|e| {
            log::warn!("{}: undecodable response parameters: {}", context, e);
            OcaError::InvalidProxyMethodResponse
        })
    }

    pub fn is_empty(&self) -> bool {
        self.parameter_count == 0 && self.parameter_data.is_empty()
    }

    fn encode_into(&self, buffer: &mut BytesMut) {
        buffer.put_u8(self.parameter_count);
        buffer.put_slice(&self.parameter_data);
    }
}

/// Log a declared parameter count that differs from the expected one
///
/// # Returns
/// Whether the counts match
pub fn check_parameter_count(declared: u8, expected: u8, context: &str) -> bool {
    if declared == expected {
        return true;
    }
    log::warn!(
        "{}: expected {} parameters, message declares {}",
        context,
        expected,
        declared
    );
    false
}

/// One record of an extension block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub extension_id: u16,
    pub data: Vec<u8>,
}

fn encode_extensions(extensions: &[Extension], buffer: &mut BytesMut) -> OcaResult<()> {
    let mut encoder = Ocp1Encoder::new();
    encoder.put_count(extensions.len())?;
    for extension in extensions {
        encoder.put_u16(extension.extension_id);
        encoder.put_blob(&extension.data)?;
    }
    buffer.put_slice(&encoder.into_bytes());
    Ok(())
}

fn decode_extensions(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Vec<Extension>> {
    let count = decoder.get_u16()?;
    let mut extensions = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let extension_id = decoder.get_u16()?;
        let data = decoder.get_blob()?.to_vec();
        extensions.push(Extension { extension_id, data });
    }
    Ok(extensions)
}

fn reject_extensions(extensions: &[Extension], options: CodecOptions) -> OcaResult<()> {
    if !extensions.is_empty() && !options.extensions {
        return Err(OcaError::InvalidData(
            "extensions require the extended message layout".to_string(),
        ));
    }
    Ok(())
}

/// A method invocation sent from controller to device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub handle: u32,
    pub target_ono: ONo,
    pub method_id: MethodID,
    pub extensions: Vec<Extension>,
    pub parameters: Parameters,
}

impl Command {
    /// size(4) handle(4) target(4) method(4) count(1)
    pub const MINIMUM_SIZE: usize = 17;

    pub fn new(handle: u32, target_ono: ONo, method_id: MethodID, parameters: Parameters) -> Self {
        Self {
            handle,
            target_ono,
            method_id,
            extensions: Vec::new(),
            parameters,
        }
    }

    fn encode_body(&self, buffer: &mut BytesMut, options: CodecOptions) -> OcaResult<()> {
        reject_extensions(&self.extensions, options)?;
        buffer.put_u32(self.handle);
        buffer.put_u32(self.target_ono);
        buffer.put_u16(self.method_id.def_level);
        buffer.put_u16(self.method_id.method_index);
        if options.extensions {
            encode_extensions(&self.extensions, buffer)?;
        }
        self.parameters.encode_into(buffer);
        Ok(())
    }

    pub fn decode(bytes: &[u8], options: CodecOptions) -> OcaResult<Self> {
        let minimum = Self::MINIMUM_SIZE + if options.extensions { 2 } else { 0 };
        if bytes.len() < minimum {
            return Err(OcaError::PduTooShort);
        }
        let mut decoder = Ocp1Decoder::new(bytes);
        let _size = decoder.get_u32()?;
        let handle = decoder.get_u32()?;
        let target_ono = decoder.get_u32()?;
        let method_id = decoder.decode()?;
        let extensions = if options.extensions {
            decode_extensions(&mut decoder)?
        } else {
            Vec::new()
        };
        let parameter_count = decoder.get_u8()?;
        let parameter_data = decoder.get_remaining().to_vec();
        Ok(Self {
            handle,
            target_ono,
            method_id,
            extensions,
            parameters: Parameters::new(parameter_count, parameter_data),
        })
    }
}

/// The device's reply to a command that required one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub handle: u32,
    pub status_code: OcaStatus,
    pub extensions: Vec<Extension>,
    pub parameters: Parameters,
}

impl Response {
    /// size(4) handle(4) status(1) count(1)
    pub const MINIMUM_SIZE: usize = 10;

    pub fn new(handle: u32, status_code: OcaStatus, parameters: Parameters) -> Self {
        Self {
            handle,
            status_code,
            extensions: Vec::new(),
            parameters,
        }
    }

    /// A parameterless response carrying only a status
    pub fn status(handle: u32, status_code: OcaStatus) -> Self {
        Self::new(handle, status_code, Parameters::default())
    }

    fn encode_body(&self, buffer: &mut BytesMut, options: CodecOptions) -> OcaResult<()> {
        reject_extensions(&self.extensions, options)?;
        buffer.put_u32(self.handle);
        buffer.put_u8(self.status_code.as_u8());
        if options.extensions {
            encode_extensions(&self.extensions, buffer)?;
        }
        self.parameters.encode_into(buffer);
        Ok(())
    }

    pub fn decode(bytes: &[u8], options: CodecOptions) -> OcaResult<Self> {
        let minimum = Self::MINIMUM_SIZE + if options.extensions { 2 } else { 0 };
        if bytes.len() < minimum {
            return Err(OcaError::PduTooShort);
        }
        let mut decoder = Ocp1Decoder::new(bytes);
        let _size = decoder.get_u32()?;
        let handle = decoder.get_u32()?;
        let status_code = decoder.decode()?;
        let extensions = if options.extensions {
            decode_extensions(&mut decoder)?
        } else {
            Vec::new()
        };
        let parameter_count = decoder.get_u8()?;
        let parameter_data = decoder.get_remaining().to_vec();
        Ok(Self {
            handle,
            status_code,
            extensions,
            parameters: Parameters::new(parameter_count, parameter_data),
        })
    }
}

/// EV1 notification: a call of the subscriber's method carrying the event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification1 {
    pub target_ono: ONo,
    pub method_id: MethodID,
    /// Number of subscriber-method parameters; 2 for an event notification
    pub parameter_count: u8,
    pub context: Blob,
    pub event: Event,
    pub event_data: Vec<u8>,
}

impl Notification1 {
    /// size(4) target(4) method(4) count(1) context length(2) event(8)
    pub const MINIMUM_SIZE: usize = 23;
    /// Context plus event data
    pub const EVENT_PARAMETER_COUNT: u8 = 2;

    /// Whether the notification carries the context and event parameters of
    /// an event; a mismatch is logged
    pub fn has_event_parameters(&self) -> bool {
        check_parameter_count(
            self.parameter_count,
            Self::EVENT_PARAMETER_COUNT,
            "notification",
        )
    }

    fn encode_body(&self, buffer: &mut BytesMut) -> OcaResult<()> {
        let mut encoder = Ocp1Encoder::with_capacity(16 + self.context.0.len());
        encoder.put_u32(self.target_ono);
        encoder.encode(&self.method_id)?;
        encoder.put_u8(self.parameter_count);
        encoder.encode(&self.context)?;
        encoder.encode(&self.event)?;
        buffer.put_slice(&encoder.into_bytes());
        buffer.put_slice(&self.event_data);
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> OcaResult<Self> {
        if bytes.len() < Self::MINIMUM_SIZE {
            return Err(OcaError::PduTooShort);
        }
        let mut decoder = Ocp1Decoder::new(bytes);
        let _size = decoder.get_u32()?;
        Ok(Self {
            target_ono: decoder.get_u32()?,
            method_id: decoder.decode()?,
            parameter_count: decoder.get_u8()?,
            context: decoder.decode()?,
            event: decoder.decode()?,
            event_data: decoder.get_remaining().to_vec(),
        })
    }
}

/// EV2 notification payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Notification2Type {
    Event = 0,
    Exception = 1,
}

/// EV2 notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification2 {
    pub event: Event,
    pub notification_type: Notification2Type,
    pub data: Vec<u8>,
}

impl Notification2 {
    /// size(4) event(8) type(1)
    pub const MINIMUM_SIZE: usize = 13;

    pub fn event(event: Event, data: Vec<u8>) -> Self {
        Self {
            event,
            notification_type: Notification2Type::Event,
            data,
        }
    }

    pub fn exception(event: Event, exception: &NotificationException) -> OcaResult<Self> {
        Ok(Self {
            event,
            notification_type: Notification2Type::Exception,
            data: oca_core::encode_value(exception)?,
        })
    }

    /// Surface an exception notification as an error
    pub fn check_exception(&self) -> OcaResult<()> {
        match self.notification_type {
            Notification2Type::Event => Ok(()),
            Notification2Type::Exception => {
                let exception: NotificationException = oca_core::decode_value(&self.data)?;
                Err(OcaError::Exception(exception))
            }
        }
    }

    fn encode_body(&self, buffer: &mut BytesMut) -> OcaResult<()> {
        let mut encoder = Ocp1Encoder::with_capacity(9);
        encoder.encode(&self.event)?;
        encoder.put_u8(self.notification_type as u8);
        buffer.put_slice(&encoder.into_bytes());
        buffer.put_slice(&self.data);
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> OcaResult<Self> {
        if bytes.len() < Self::MINIMUM_SIZE {
            return Err(OcaError::PduTooShort);
        }
        let mut decoder = Ocp1Decoder::new(bytes);
        let _size = decoder.get_u32()?;
        let event = decoder.decode()?;
        let notification_type = match decoder.get_u8()? {
            0 => Notification2Type::Event,
            1 => Notification2Type::Exception,
            _ => return Err(OcaError::BadFormat),
        };
        Ok(Self {
            event,
            notification_type,
            data: decoder.get_remaining().to_vec(),
        })
    }
}

/// Heartbeat announcement; the body has no size field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepAlive {
    /// KeepAlive1: heartbeat in whole seconds
    Seconds(u16),
    /// KeepAlive2: heartbeat in milliseconds
    Milliseconds(u32),
}

impl KeepAlive {
    /// Choose the compact seconds form when the heartbeat is a whole number of seconds
    pub fn from_duration(heartbeat: Duration) -> Self {
        let millis = heartbeat.as_millis();
        if millis % 1000 == 0 && millis / 1000 <= u128::from(u16::MAX) {
            Self::Seconds((millis / 1000) as u16)
        } else {
            Self::Milliseconds(u32::try_from(millis).unwrap_or(u32::MAX))
        }
    }

    pub fn heartbeat(&self) -> Duration {
        match self {
            Self::Seconds(s) => Duration::from_secs(u64::from(*s)),
            Self::Milliseconds(ms) => Duration::from_millis(u64::from(*ms)),
        }
    }

    fn encode_body(&self, buffer: &mut BytesMut) {
        match self {
            Self::Seconds(s) => buffer.put_u16(*s),
            Self::Milliseconds(ms) => buffer.put_u32(*ms),
        }
    }

    pub fn decode(bytes: &[u8]) -> OcaResult<Self> {
        match bytes.len() {
            2 => Ok(Self::Seconds(u16::from_be_bytes([bytes[0], bytes[1]]))),
            4 => Ok(Self::Milliseconds(u32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            _ => Err(OcaError::InvalidKeepAlivePdu),
        }
    }
}

/// Any OCP.1 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Command not requiring a response
    Command(Command),
    /// Command requiring a response
    CommandRrq(Command),
    Response(Response),
    Notification1(Notification1),
    Notification2(Notification2),
    KeepAlive(KeepAlive),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Command(_) => MessageType::Command,
            Self::CommandRrq(_) => MessageType::CommandRrq,
            Self::Response(_) => MessageType::Response,
            Self::Notification1(_) => MessageType::Notification1,
            Self::Notification2(_) => MessageType::Notification2,
            Self::KeepAlive(_) => MessageType::KeepAlive,
        }
    }

    /// Append the encoded message, patching its size field with the true length
    pub fn encode_into(&self, buffer: &mut BytesMut, options: CodecOptions) -> OcaResult<()> {
        if let Self::KeepAlive(keep_alive) = self {
            keep_alive.encode_body(buffer);
            return Ok(());
        }

        let start = buffer.len();
        buffer.put_u32(0);
        match self {
            Self::Command(command) | Self::CommandRrq(command) => {
                command.encode_body(buffer, options)?
            }
            Self::Response(response) => response.encode_body(buffer, options)?,
            Self::Notification1(notification) => notification.encode_body(buffer)?,
            Self::Notification2(notification) => notification.encode_body(buffer)?,
            Self::KeepAlive(_) => {}
        }

        let size = u32::try_from(buffer.len() - start).map_err(|_| OcaError::InvalidMessageSize)?;
        buffer[start..start + 4].copy_from_slice(&size.to_be_bytes());
        Ok(())
    }

    /// Encode the message on its own, without PDU header
    pub fn encode(&self, options: CodecOptions) -> OcaResult<BytesMut> {
        let mut buffer = BytesMut::with_capacity(32);
        self.encode_into(&mut buffer, options)?;
        Ok(buffer)
    }

    /// Decode one message whose kind is given by the PDU header
    pub fn decode(bytes: &[u8], message_type: MessageType, options: CodecOptions) -> OcaResult<Self> {
        Ok(match message_type {
            MessageType::Command => Self::Command(Command::decode(bytes, options)?),
            MessageType::CommandRrq => Self::CommandRrq(Command::decode(bytes, options)?),
            MessageType::Response => Self::Response(Response::decode(bytes, options)?),
            MessageType::Notification1 => Self::Notification1(Notification1::decode(bytes)?),
            MessageType::Notification2 => Self::Notification2(Notification2::decode(bytes)?),
            MessageType::KeepAlive => Self::KeepAlive(KeepAlive::decode(bytes)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oca_core::{EventID, NotificationExceptionType};

    fn round_trip(message: Message, options: CodecOptions) {
        let bytes = message.encode(options).unwrap();
        let decoded = Message::decode(&bytes, message.message_type(), options).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_command_layout() {
        let command = Command::new(7, 0x1000, MethodID::new(1, 1), Parameters::default());
        let bytes = Message::CommandRrq(command).encode(CodecOptions::LEGACY).unwrap();
        assert_eq!(
            &bytes[..],
            &[
                0x00, 0x00, 0x00, 0x11, // size
                0x00, 0x00, 0x00, 0x07, // handle
                0x00, 0x00, 0x10, 0x00, // target
                0x00, 0x01, 0x00, 0x01, // method 1.1
                0x00, // no parameters
            ]
        );
    }

    #[test]
    fn test_command_short() {
        assert!(matches!(
            Command::decode(&[0u8; 16], CodecOptions::LEGACY),
            Err(OcaError::PduTooShort)
        ));
        assert!(matches!(
            Command::decode(&[0u8; 17], CodecOptions::EXTENDED),
            Err(OcaError::PduTooShort)
        ));
    }

    #[test]
    fn test_command_with_extensions() {
        let mut command = Command::new(
            9,
            4096,
            MethodID::new(4, 2),
            Parameters::new(1, vec![0, 1]),
        );
        command.extensions = vec![
            Extension {
                extension_id: 1,
                data: vec![0xAA],
            },
            Extension {
                extension_id: 2,
                data: Vec::new(),
            },
        ];
        round_trip(Message::Command(command.clone()), CodecOptions::EXTENDED);

        // the legacy layout cannot express extensions
        assert!(Message::Command(command).encode(CodecOptions::LEGACY).is_err());
    }

    #[test]
    fn test_response_round_trip() {
        round_trip(
            Message::Response(Response::status(100, OcaStatus::BadONo)),
            CodecOptions::LEGACY,
        );
        round_trip(
            Message::Response(Response::new(
                101,
                OcaStatus::Ok,
                Parameters::new(1, vec![1, 2, 3]),
            )),
            CodecOptions::EXTENDED,
        );
    }

    #[test]
    fn test_response_unknown_status() {
        let bytes = [0, 0, 0, 10, 0, 0, 0, 1, 99, 0];
        assert!(matches!(
            Response::decode(&bytes, CodecOptions::LEGACY),
            Err(OcaError::BadFormat)
        ));
    }

    #[test]
    fn test_notification1_round_trip() {
        let notification = Notification1 {
            target_ono: 1055,
            method_id: MethodID::new(1, 1),
            parameter_count: Notification1::EVENT_PARAMETER_COUNT,
            context: Blob::new([1u8, 2, 3, 4]),
            event: Event::new(4096, EventID::new(1, 1)),
            event_data: vec![0, 4, 0, 1, 0x3F, 0x80, 0, 0, 1],
        };
        let bytes = Message::Notification1(notification.clone())
            .encode(CodecOptions::LEGACY)
            .unwrap();
        assert_eq!(bytes.len(), Notification1::MINIMUM_SIZE + 4 + 9);
        round_trip(Message::Notification1(notification), CodecOptions::LEGACY);
    }

    #[test]
    fn test_notification2_exception() {
        let exception = NotificationException {
            exception_type: NotificationExceptionType::ObjectDeleted,
            try_again: false,
            data: Blob::default(),
        };
        let notification =
            Notification2::exception(Event::new(4096, EventID::new(1, 1)), &exception).unwrap();
        match notification.check_exception() {
            Err(OcaError::Exception(e)) => assert_eq!(e, exception),
            other => panic!("unexpected {:?}", other),
        }
        round_trip(Message::Notification2(notification), CodecOptions::LEGACY);

        let empty = Notification2::event(Event::new(1, EventID::new(1, 1)), Vec::new());
        assert!(empty.check_exception().is_ok());
        round_trip(Message::Notification2(empty), CodecOptions::LEGACY);
    }

    #[test]
    fn test_keepalive_forms() {
        assert_eq!(
            KeepAlive::from_duration(Duration::from_secs(2)),
            KeepAlive::Seconds(2)
        );
        assert_eq!(
            KeepAlive::from_duration(Duration::from_millis(1500)),
            KeepAlive::Milliseconds(1500)
        );
        assert_eq!(KeepAlive::decode(&[0, 3]).unwrap().heartbeat(), Duration::from_secs(3));
        assert!(matches!(
            KeepAlive::decode(&[0, 0, 3]),
            Err(OcaError::InvalidKeepAlivePdu)
        ));
    }

    #[test]
    fn test_parameters_value_helpers() {
        let parameters = Parameters::from_value(1, &42u16).unwrap();
        assert_eq!(parameters.parameter_data, vec![0, 42]);
        assert_eq!(parameters.decode::<u16>().unwrap(), 42);
        assert!(parameters.decode::<u32>().is_err());
    }

    #[test]
    fn test_decode_result_tolerates_count_mismatch() {
        // declares three parameters but carries one u16
        let parameters = Parameters::new(3, vec![0, 42]);
        assert!(!parameters.check_count(1, "get"));
        assert_eq!(parameters.decode_result::<u16>(1, "get").unwrap(), 42);
        assert!(matches!(
            parameters.decode_result::<u32>(1, "get"),
            Err(OcaError::InvalidProxyMethodResponse)
        ));
    }

    #[test]
    fn test_notification1_event_parameters() {
        let mut notification = Notification1 {
            target_ono: 1,
            method_id: MethodID::new(1, 1),
            parameter_count: Notification1::EVENT_PARAMETER_COUNT,
            context: Blob::default(),
            event: Event::new(4096, EventID::new(1, 1)),
            event_data: Vec::new(),
        };
        assert!(notification.has_event_parameters());
        notification.parameter_count = 1;
        assert!(!notification.has_event_parameters());
    }
}
