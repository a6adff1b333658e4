//! Big-endian parameter encoding for OCA data types
//!
//! Command parameters, response values and event data are all encoded the
//! same way: fixed-width big-endian integers, `u16`-length-prefixed strings
//! and blobs, `u16`-count-prefixed lists and maps. [`Ocp1Encoder`] and
//! [`Ocp1Decoder`] provide the primitives; [`WireEncode`] and [`WireDecode`]
//! are implemented for every base type and for the composite types of this
//! crate.

use crate::error::{OcaError, OcaResult};
use crate::types::*;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Encoder producing OCP.1 parameter bytes
#[derive(Debug, Default)]
pub struct Ocp1Encoder {
    buffer: BytesMut,
}

impl Ocp1Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buffer.put_u64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buffer.put_u8(u8::from(value));
    }

    /// Append raw bytes without a length prefix
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }

    /// Append a `u16` length prefix followed by the bytes
    pub fn put_blob(&mut self, bytes: &[u8]) -> OcaResult<()> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| OcaError::InvalidData(format!("blob of {} bytes is too long", bytes.len())))?;
        self.buffer.put_u16(len);
        self.buffer.put_slice(bytes);
        Ok(())
    }

    /// Append a string as its Unicode scalar count followed by UTF-8 bytes
    pub fn put_string(&mut self, value: &str) -> OcaResult<()> {
        let count = u16::try_from(value.chars().count())
            .map_err(|_| OcaError::InvalidData("string is too long".to_string()))?;
        self.buffer.put_u16(count);
        self.buffer.put_slice(value.as_bytes());
        Ok(())
    }

    /// Append a `u16` element count
    pub fn put_count(&mut self, count: usize) -> OcaResult<()> {
        let count = u16::try_from(count)
            .map_err(|_| OcaError::InvalidData(format!("{} elements exceed list limit", count)))?;
        self.buffer.put_u16(count);
        Ok(())
    }

    pub fn encode<T: WireEncode + ?Sized>(&mut self, value: &T) -> OcaResult<()> {
        value.encode(self)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.to_vec()
    }
}

/// Decoder reading OCP.1 parameter bytes
#[derive(Debug)]
pub struct Ocp1Decoder<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Ocp1Decoder<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> OcaResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(OcaError::PduTooShort);
        }
        let slice = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> OcaResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> OcaResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> OcaResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_u64(&mut self) -> OcaResult<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn get_bool(&mut self) -> OcaResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Read exactly `len` raw bytes
    pub fn get_slice(&mut self, len: usize) -> OcaResult<&'a [u8]> {
        self.take(len)
    }

    /// Read everything that is left
    pub fn get_remaining(&mut self) -> &'a [u8] {
        let rest = &self.buffer[self.position..];
        self.position = self.buffer.len();
        rest
    }

    pub fn get_blob(&mut self) -> OcaResult<&'a [u8]> {
        let len = self.get_u16()?;
        self.take(usize::from(len))
    }

    pub fn get_string(&mut self) -> OcaResult<String> {
        let count = usize::from(self.get_u16()?);
        let rest = &self.buffer[self.position..];
        let mut byte_len = 0;
        let mut chars = 0;
        // the prefix counts scalars, so walk UTF-8 lead bytes to find the end
        while chars < count {
            let lead = *rest.get(byte_len).ok_or(OcaError::PduTooShort)?;
            byte_len += match lead {
                0x00..=0x7F => 1,
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF7 => 4,
                _ => return Err(OcaError::BadFormat),
            };
            chars += 1;
        }
        let bytes = self.take(byte_len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| OcaError::BadFormat)
    }

    pub fn decode<T: WireDecode>(&mut self) -> OcaResult<T> {
        T::decode(self)
    }
}

/// A value that can be written as OCP.1 parameter bytes
pub trait WireEncode {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()>;
}

/// A value that can be read from OCP.1 parameter bytes
pub trait WireDecode: Sized {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self>;
}

/// Encode a single value into a fresh byte vector
pub fn encode_value<T: WireEncode + ?Sized>(value: &T) -> OcaResult<Vec<u8>> {
    let mut encoder = Ocp1Encoder::new();
    value.encode(&mut encoder)?;
    Ok(encoder.into_vec())
}

/// Decode a single value, requiring the input to be fully consumed
pub fn decode_value<T: WireDecode>(bytes: &[u8]) -> OcaResult<T> {
    let mut decoder = Ocp1Decoder::new(bytes);
    let value = T::decode(&mut decoder)?;
    if !decoder.is_empty() {
        log::debug!(
            "{} trailing bytes after decoding {}",
            decoder.remaining(),
            std::any::type_name::<T>()
        );
        return Err(OcaError::BadFormat);
    }
    Ok(value)
}

/// The unit value encodes to nothing; used for methods without parameters
impl WireEncode for () {
    fn encode(&self, _encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        Ok(())
    }
}

impl WireDecode for () {
    fn decode(_decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(())
    }
}

macro_rules! wire_integer {
    ($($ty:ty => $put:ident, $get:ident, $as:ty);* $(;)?) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
                    encoder.$put(*self as $as);
                    Ok(())
                }
            }

            impl WireDecode for $ty {
                fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
                    Ok(decoder.$get()? as $ty)
                }
            }
        )*
    };
}

wire_integer! {
    u8 => put_u8, get_u8, u8;
    u16 => put_u16, get_u16, u16;
    u32 => put_u32, get_u32, u32;
    u64 => put_u64, get_u64, u64;
    i8 => put_u8, get_u8, u8;
    i16 => put_u16, get_u16, u16;
    i32 => put_u32, get_u32, u32;
    i64 => put_u64, get_u64, u64;
}

impl WireEncode for f32 {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_u32(self.to_bits());
        Ok(())
    }
}

impl WireDecode for f32 {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(f32::from_bits(decoder.get_u32()?))
    }
}

impl WireEncode for f64 {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_u64(self.to_bits());
        Ok(())
    }
}

impl WireDecode for f64 {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(f64::from_bits(decoder.get_u64()?))
    }
}

impl WireEncode for bool {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_bool(*self);
        Ok(())
    }
}

impl WireDecode for bool {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        decoder.get_bool()
    }
}

impl WireEncode for str {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_string(self)
    }
}

impl WireEncode for String {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_string(self)
    }
}

impl WireDecode for String {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        decoder.get_string()
    }
}

impl WireEncode for Blob {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_blob(&self.0)
    }
}

impl WireDecode for Blob {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(Blob(decoder.get_blob()?.to_vec()))
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_count(self.len())?;
        for item in self {
            item.encode(encoder)?;
        }
        Ok(())
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        let count = decoder.get_u16()?;
        (0..count).map(|_| T::decode(decoder)).collect()
    }
}

impl<K: WireEncode, V: WireEncode> WireEncode for BTreeMap<K, V> {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_count(self.len())?;
        for (key, value) in self {
            key.encode(encoder)?;
            value.encode(encoder)?;
        }
        Ok(())
    }
}

impl<K: WireDecode + Ord, V: WireDecode> WireDecode for BTreeMap<K, V> {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        let count = decoder.get_u16()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = K::decode(decoder)?;
            let value = V::decode(decoder)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<T: WireEncode> WireEncode for List2D<T> {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        if self.items.len() != usize::from(self.nx) * usize::from(self.ny) {
            return Err(OcaError::InvalidData(format!(
                "2-D list of {}x{} holds {} items",
                self.nx,
                self.ny,
                self.items.len()
            )));
        }
        encoder.put_u16(self.nx);
        encoder.put_u16(self.ny);
        for item in &self.items {
            item.encode(encoder)?;
        }
        Ok(())
    }
}

impl<T: WireDecode> WireDecode for List2D<T> {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        let nx = decoder.get_u16()?;
        let ny = decoder.get_u16()?;
        let items = (0..usize::from(nx) * usize::from(ny))
            .map(|_| T::decode(decoder))
            .collect::<OcaResult<Vec<T>>>()?;
        Ok(Self { nx, ny, items })
    }
}

impl<A: WireEncode, B: WireEncode> WireEncode for (A, B) {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        self.0.encode(encoder)?;
        self.1.encode(encoder)
    }
}

impl<A: WireDecode, B: WireDecode> WireDecode for (A, B) {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok((A::decode(decoder)?, B::decode(decoder)?))
    }
}

macro_rules! wire_level_index {
    ($($ty:ident { $index:ident }),* $(,)?) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
                    encoder.put_u16(self.def_level);
                    encoder.put_u16(self.$index);
                    Ok(())
                }
            }

            impl WireDecode for $ty {
                fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
                    let def_level = decoder.get_u16()?;
                    let $index = decoder.get_u16()?;
                    Ok(Self { def_level, $index })
                }
            }
        )*
    };
}

wire_level_index! {
    MethodID { method_index },
    PropertyID { property_index },
    EventID { event_index },
}

impl WireEncode for Event {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_u32(self.emitter_ono);
        self.event_id.encode(encoder)
    }
}

impl WireDecode for Event {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(Self {
            emitter_ono: decoder.get_u32()?,
            event_id: decoder.decode()?,
        })
    }
}

impl WireEncode for Method {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_u32(self.ono);
        self.method_id.encode(encoder)
    }
}

impl WireDecode for Method {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(Self {
            ono: decoder.get_u32()?,
            method_id: decoder.decode()?,
        })
    }
}

impl WireEncode for ClassID {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_count(self.field_count())?;
        for field in self.fields() {
            encoder.put_u16(*field);
        }
        Ok(())
    }
}

impl WireDecode for ClassID {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        let count = decoder.get_u16()?;
        let fields = (0..count)
            .map(|_| decoder.get_u16())
            .collect::<OcaResult<Vec<u16>>>()?;
        Ok(ClassID::new(fields))
    }
}

impl WireEncode for ClassIdentification {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        self.class_id.encode(encoder)?;
        encoder.put_u16(self.class_version);
        Ok(())
    }
}

impl WireDecode for ClassIdentification {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(Self {
            class_id: decoder.decode()?,
            class_version: decoder.get_u16()?,
        })
    }
}

impl WireEncode for ObjectIdentification {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_u32(self.ono);
        self.class_identification.encode(encoder)
    }
}

impl WireDecode for ObjectIdentification {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(Self {
            ono: decoder.get_u32()?,
            class_identification: decoder.decode()?,
        })
    }
}

macro_rules! wire_u8_enum {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
                    encoder.put_u8(*self as u8);
                    Ok(())
                }
            }

            impl WireDecode for $ty {
                fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
                    <$ty>::try_from(decoder.get_u8()?)
                }
            }
        )*
    };
}

wire_u8_enum!(
    PropertyChangeType,
    NotificationDeliveryMode,
    LockStatus,
    NotificationExceptionType,
);

impl WireEncode for crate::status::OcaStatus {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        encoder.put_u8(self.as_u8());
        Ok(())
    }
}

impl WireDecode for crate::status::OcaStatus {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        crate::status::OcaStatus::try_from(decoder.get_u8()?).map_err(|_| OcaError::BadFormat)
    }
}

impl WireEncode for NotificationException {
    fn encode(&self, encoder: &mut Ocp1Encoder) -> OcaResult<()> {
        self.exception_type.encode(encoder)?;
        encoder.put_bool(self.try_again);
        self.data.encode(encoder)
    }
}

impl WireDecode for NotificationException {
    fn decode(decoder: &mut Ocp1Decoder<'_>) -> OcaResult<Self> {
        Ok(Self {
            exception_type: decoder.decode()?,
            try_again: decoder.get_bool()?,
            data: decoder.decode()?,
        })
    }
}
