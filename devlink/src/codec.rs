//! Codecs converting raw payloads to structured values and back.
//!
//! The codec stage holds an ordered list of codecs. Built-in codecs, which
//! claim packets by type tag, come first so link-level traffic such as the
//! identity query is always decoded the same way; custom codecs follow and
//! usually claim by message identifier.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{MessageId, TypeTag};

/// Conversion between a payload and a structured value.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this codec handles packets with this identifier and type.
    fn claims(&self, message_id: &MessageId, type_tag: TypeTag) -> bool;

    fn encode(&self, value: &Value) -> Result<Bytes>;

    fn decode(&self, payload: &[u8]) -> Result<Value>;
}

/// Fixed-width numbers, one value or an array of values.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveCodec {
    type_tag: TypeTag,
    width: usize,
}

impl PrimitiveCodec {
    pub fn new(type_tag: TypeTag) -> Option<Self> {
        type_tag
            .element_width()
            .map(|width| Self { type_tag, width })
    }

    fn read(&self, chunk: &[u8]) -> Value {
        match self.type_tag {
            TypeTag::Int8 => Value::from(chunk[0] as i8),
            TypeTag::Int16 => Value::from(i16::from_le_bytes([chunk[0], chunk[1]])),
            TypeTag::Uint16 => Value::from(u16::from_le_bytes([chunk[0], chunk[1]])),
            TypeTag::Int32 => Value::from(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            TypeTag::Uint32 => Value::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            TypeTag::Float => {
                Value::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64)
            }
            TypeTag::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                Value::from(f64::from_le_bytes(raw))
            }
            _ => Value::from(chunk[0]),
        }
    }

    fn write(&self, value: &Value, dst: &mut BytesMut) -> Result<()> {
        let out_of_range = || {
            Error::Protocol(format!("{} cannot be encoded as {}", value, self.type_tag))
        };
        match self.type_tag {
            TypeTag::Float => dst.put_f32_le(value.as_f64().ok_or_else(out_of_range)? as f32),
            TypeTag::Double => dst.put_f64_le(value.as_f64().ok_or_else(out_of_range)?),
            _ => {
                let n = value.as_i64().ok_or_else(out_of_range)?;
                match self.type_tag {
                    TypeTag::Int8 => dst.put_i8(i8::try_from(n).map_err(|_| out_of_range())?),
                    TypeTag::Int16 => dst.put_i16_le(i16::try_from(n).map_err(|_| out_of_range())?),
                    TypeTag::Uint16 => dst.put_u16_le(u16::try_from(n).map_err(|_| out_of_range())?),
                    TypeTag::Int32 => dst.put_i32_le(i32::try_from(n).map_err(|_| out_of_range())?),
                    TypeTag::Uint32 => dst.put_u32_le(u32::try_from(n).map_err(|_| out_of_range())?),
                    _ => dst.put_u8(u8::try_from(n).map_err(|_| out_of_range())?),
                }
            }
        }
        Ok(())
    }
}

impl Codec for PrimitiveCodec {
    fn name(&self) -> &str {
        "primitive"
    }

    fn claims(&self, _message_id: &MessageId, type_tag: TypeTag) -> bool {
        type_tag == self.type_tag
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        match value {
            Value::Array(items) => {
                for item in items {
                    self.write(item, &mut dst)?;
                }
            }
            other => self.write(other, &mut dst)?,
        }
        Ok(dst.freeze())
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        if payload.len() % self.width != 0 {
            return Err(Error::Protocol(format!(
                "{} payload of {} bytes is not a multiple of {}",
                self.type_tag,
                payload.len(),
                self.width
            )));
        }
        let mut values: Vec<Value> = payload.chunks(self.width).map(|c| self.read(c)).collect();
        Ok(match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        })
    }
}

/// Text payloads, with trailing NULs dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharCodec;

impl Codec for CharCodec {
    fn name(&self) -> &str {
        "char"
    }

    fn claims(&self, _message_id: &MessageId, type_tag: TypeTag) -> bool {
        type_tag == TypeTag::Char
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        let text = value
            .as_str()
            .ok_or_else(|| Error::Protocol(format!("{} is not a string", value)))?;
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        let end = payload.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        Ok(Value::String(String::from_utf8_lossy(&payload[..end]).into_owned()))
    }
}

/// Payload-less trigger messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackCodec;

impl Codec for CallbackCodec {
    fn name(&self) -> &str {
        "callback"
    }

    fn claims(&self, _message_id: &MessageId, type_tag: TypeTag) -> bool {
        type_tag == TypeTag::Callback
    }

    fn encode(&self, _value: &Value) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    fn decode(&self, _payload: &[u8]) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Custom-typed messages carrying JSON text, claimed by identifier.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    message_ids: HashSet<MessageId>,
}

impl JsonCodec {
    pub fn for_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MessageId>,
    {
        Self {
            message_ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn claims(&self, message_id: &MessageId, type_tag: TypeTag) -> bool {
        type_tag == TypeTag::Custom && self.message_ids.contains(message_id)
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        serde_json::from_slice(payload).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// The built-in codecs, one per standard type tag.
pub fn default_codecs() -> Vec<Arc<dyn Codec>> {
    let mut codecs: Vec<Arc<dyn Codec>> = vec![Arc::new(CallbackCodec), Arc::new(CharCodec)];
    for tag in [
        TypeTag::Byte,
        TypeTag::Int8,
        TypeTag::Uint8,
        TypeTag::Int16,
        TypeTag::Uint16,
        TypeTag::Int32,
        TypeTag::Uint32,
        TypeTag::Float,
        TypeTag::Double,
    ] {
        if let Some(codec) = PrimitiveCodec::new(tag) {
            codecs.push(Arc::new(codec));
        }
    }
    codecs
}

/// Ordered codec list, searched front to back.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in codecs first, then `custom` in the given order.
    pub fn with_defaults(custom: impl IntoIterator<Item = Arc<dyn Codec>>) -> Self {
        let mut registry = Self::new();
        registry.add_codecs(default_codecs());
        registry.add_codecs(custom);
        registry
    }

    pub fn add_codecs(&mut self, codecs: impl IntoIterator<Item = Arc<dyn Codec>>) {
        self.codecs.extend(codecs);
    }

    pub fn find(&self, message_id: &MessageId, type_tag: TypeTag) -> Option<&Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.claims(message_id, type_tag))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.codecs.iter().map(|c| c.name()))
            .finish()
    }
}
