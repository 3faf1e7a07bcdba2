//! Marshalled values
//!
//! Attachment values and message bodies travel as a tagged [`Value`].
//! On the wire a value is a 4 byte big-endian payload length followed
//! by the bincode encoding of the value.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::CodecError;

/// Size of the length prefix in front of every marshalled value
pub const VALUE_LENGTH_SIZE: usize = 4;

/// A value carried in an attachment or a message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Int(i32),
    Long(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// The signed byte inside a `Byte` value, used by login responses
    pub fn as_byte(&self) -> Option<i8> {
        match self {
            Value::Byte(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Byte(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Append one marshalled value to `buf`
pub fn marshal(value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    let payload = bincode::serialize(value)?;
    buf.reserve(VALUE_LENGTH_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(())
}

/// Read one marshalled value from the front of `buf`, advancing past it
pub fn unmarshal(buf: &mut impl Buf) -> Result<Value, CodecError> {
    if buf.remaining() < VALUE_LENGTH_SIZE {
        return Err(CodecError::MalformedFrame(format!(
            "value length prefix needs {} bytes, {} left",
            VALUE_LENGTH_SIZE,
            buf.remaining()
        )));
    }

    let len = buf.get_u32() as usize;
    if len > buf.remaining() {
        return Err(CodecError::MalformedFrame(format!(
            "value declares {} bytes, {} left",
            len,
            buf.remaining()
        )));
    }

    let payload = buf.copy_to_bytes(len);
    bincode::deserialize(&payload)
        .map_err(|e| CodecError::MalformedFrame(format!("corrupt value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_layout() {
        let mut buf = BytesMut::new();
        marshal(&Value::Byte(-1), &mut buf).unwrap();

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(declared, buf.len() - VALUE_LENGTH_SIZE);
    }

    #[test]
    fn test_values_read_back_in_sequence() {
        let mut buf = BytesMut::new();
        let values = vec![
            Value::Null,
            Value::from("node-a"),
            Value::from(42i64),
            Value::from(vec![1u8, 2, 3]),
        ];
        for v in &values {
            marshal(v, &mut buf).unwrap();
        }

        let mut cursor = buf.freeze();
        for expected in &values {
            assert_eq!(&unmarshal(&mut cursor).unwrap(), expected);
        }
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn test_unmarshal_overrun_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.put_slice(&[0u8; 8]);

        let err = unmarshal(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(_)));
    }

    #[test]
    fn test_unmarshal_garbage_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(0xFFFF_FFFF);

        let err = unmarshal(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(_)));
    }
}
