// ABOUTME: BSATN encoder that appends tagged values to a byte buffer
//
// Every value is written as one tag byte followed by its little-endian
// payload. Unrepresentable values are rejected before any bytes are written
// for that value, so a failed encode never leaves a half-written tag behind.

use super::error::{CodecError, CodecResult};
use super::tags::{MAX_FIELD_NAME_LEN, MAX_PAYLOAD_LEN};
use super::value::Value;

/// Appends encoded values to an owned buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Encoder with pre-reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Encode one value onto the end of the buffer.
    pub fn write(&mut self, value: &Value) -> CodecResult<()> {
        check_representable(value)?;
        self.write_unchecked(value);
        Ok(())
    }

    /// Consume the encoder and return the bytes written so far.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn write_len(&mut self, len: usize) {
        // check_representable bounds every length/count that reaches here
        #[allow(clippy::cast_possible_truncation)]
        self.write_u32(len as u32);
    }

    fn write_unchecked(&mut self, value: &Value) {
        self.buf.push(value.tag());
        match value {
            Value::Unit | Value::Bool(_) => {}
            Value::I8(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::U8(v) => self.buf.push(*v),
            Value::I16(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::U16(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => self.write_u32(*v),
            Value::I64(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::I128(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::U128(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::String(text) => {
                self.write_len(text.len());
                self.buf.extend_from_slice(text.as_bytes());
            }
            Value::Bytes(bytes) => {
                self.write_len(bytes.len());
                self.buf.extend_from_slice(bytes);
            }
            Value::Array(items) => {
                self.write_len(items.len());
                for item in items {
                    self.write_unchecked(item);
                }
            }
            Value::Struct(fields) => {
                self.write_len(fields.len());
                for (name, field) in fields {
                    #[allow(clippy::cast_possible_truncation)]
                    self.buf.push(name.len() as u8);
                    self.buf.extend_from_slice(name.as_bytes());
                    self.write_unchecked(field);
                }
            }
            Value::Enum { variant, payload } => {
                self.write_u32(*variant);
                self.write_unchecked(payload);
            }
        }
    }
}

/// Walk the value tree and reject anything the wire format cannot carry.
fn check_representable(value: &Value) -> CodecResult<()> {
    // Explicit stack: encode must not overflow on deep trees either.
    let mut stack = vec![value];
    while let Some(current) = stack.pop() {
        match current {
            Value::F32(v) if !v.is_finite() => {
                return Err(CodecError::Unrepresentable(format!("non-finite f32 {v}")));
            }
            Value::F64(v) if !v.is_finite() => {
                return Err(CodecError::Unrepresentable(format!("non-finite f64 {v}")));
            }
            Value::String(text) if text.len() > MAX_PAYLOAD_LEN => {
                return Err(CodecError::Unrepresentable(format!(
                    "string of {} bytes exceeds {MAX_PAYLOAD_LEN}",
                    text.len()
                )));
            }
            Value::Bytes(bytes) if bytes.len() > MAX_PAYLOAD_LEN => {
                return Err(CodecError::Unrepresentable(format!(
                    "byte string of {} bytes exceeds {MAX_PAYLOAD_LEN}",
                    bytes.len()
                )));
            }
            Value::Array(items) => {
                check_count(items.len(), "array")?;
                stack.extend(items.iter());
            }
            Value::Struct(fields) => {
                check_count(fields.len(), "struct")?;
                for (name, field) in fields {
                    if name.len() > MAX_FIELD_NAME_LEN {
                        return Err(CodecError::Unrepresentable(format!(
                            "field name of {} bytes exceeds {MAX_FIELD_NAME_LEN}",
                            name.len()
                        )));
                    }
                    stack.push(field);
                }
            }
            Value::Enum { payload, .. } => stack.push(payload),
            _ => {}
        }
    }
    Ok(())
}

fn check_count(count: usize, what: &str) -> CodecResult<()> {
    if u32::try_from(count).is_err() {
        return Err(CodecError::Unrepresentable(format!(
            "{what} with {count} entries exceeds u32 count"
        )));
    }
    Ok(())
}
