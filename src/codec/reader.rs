// ABOUTME: Bounded BSATN decoder with depth and payload limits
//
// Decoding never trusts a length prefix: every declared length or count is
// checked against the bytes that remain before anything is allocated, and
// container nesting is capped so hostile input cannot exhaust the stack.

use super::error::{CodecError, CodecResult, MalformedReason};
use super::tags::{self, DEFAULT_MAX_DEPTH, MAX_PAYLOAD_LEN};
use super::value::{Value, WireString};

/// Decoder configuration. Cheap to copy; each call gets its own cursor.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    max_depth: usize,
    max_payload_len: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }

    /// Maximum container nesting (arrays, structs, enums).
    #[must_use]
    pub const fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Maximum string/byte-string payload length.
    #[must_use]
    pub const fn with_max_payload_len(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Decode one value from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<(Value, usize)> {
        let mut cursor = Cursor {
            bytes,
            pos: 0,
            limits: *self,
        };
        let value = cursor.read_value(0)?;
        Ok((value, cursor.pos))
    }

    /// Decode a value that must span the whole buffer.
    pub fn decode_exact(&self, bytes: &[u8]) -> CodecResult<Value> {
        let (value, consumed) = self.decode(bytes)?;
        if consumed != bytes.len() {
            return Err(CodecError::malformed(
                consumed,
                MalformedReason::TrailingBytes(bytes.len() - consumed),
            ));
        }
        Ok(value)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    limits: Decoder,
}

impl<'a> Cursor<'a> {
    const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(CodecError::malformed(
                self.pos,
                MalformedReason::Truncated {
                    needed: len - remaining,
                },
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    fn read_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Length prefix for a string or byte payload.
    fn read_payload_len(&mut self) -> CodecResult<usize> {
        let start = self.pos;
        let len = self.read_u32()? as usize;
        if len > self.limits.max_payload_len {
            return Err(CodecError::malformed(
                start,
                MalformedReason::PayloadTooLarge {
                    len,
                    max: self.limits.max_payload_len,
                },
            ));
        }
        if len > self.remaining() {
            return Err(CodecError::malformed(
                start,
                MalformedReason::LengthOverrun {
                    declared: len,
                    remaining: self.remaining(),
                },
            ));
        }
        Ok(len)
    }

    /// Element/field count; each entry needs at least `min_entry_len` bytes.
    fn read_count(&mut self, min_entry_len: usize) -> CodecResult<usize> {
        let start = self.pos;
        let count = self.read_u32()? as usize;
        let remaining = self.remaining();
        if count.saturating_mul(min_entry_len) > remaining {
            return Err(CodecError::malformed(
                start,
                MalformedReason::LengthOverrun {
                    declared: count,
                    remaining,
                },
            ));
        }
        Ok(count)
    }

    fn enter(&self, depth: usize) -> CodecResult<usize> {
        let next = depth + 1;
        if next > self.limits.max_depth {
            return Err(CodecError::malformed(
                self.pos,
                MalformedReason::DepthExceeded {
                    limit: self.limits.max_depth,
                },
            ));
        }
        Ok(next)
    }

    fn read_value(&mut self, depth: usize) -> CodecResult<Value> {
        let tag_offset = self.pos;
        let tag = self.read_u8()?;
        let value = match tag {
            tags::TAG_BOOL_FALSE => Value::Bool(false),
            tags::TAG_BOOL_TRUE => Value::Bool(true),
            tags::TAG_UNIT => Value::Unit,
            tags::TAG_U8 => Value::U8(self.read_u8()?),
            tags::TAG_I8 => Value::I8(i8::from_le_bytes(self.take_array()?)),
            tags::TAG_U16 => Value::U16(u16::from_le_bytes(self.take_array()?)),
            tags::TAG_I16 => Value::I16(i16::from_le_bytes(self.take_array()?)),
            tags::TAG_U32 => Value::U32(self.read_u32()?),
            tags::TAG_I32 => Value::I32(i32::from_le_bytes(self.take_array()?)),
            tags::TAG_U64 => Value::U64(u64::from_le_bytes(self.take_array()?)),
            tags::TAG_I64 => Value::I64(i64::from_le_bytes(self.take_array()?)),
            tags::TAG_U128 => Value::U128(u128::from_le_bytes(self.take_array()?)),
            tags::TAG_I128 => Value::I128(i128::from_le_bytes(self.take_array()?)),
            tags::TAG_F32 => {
                let start = self.pos;
                let v = f32::from_le_bytes(self.take_array()?);
                if !v.is_finite() {
                    return Err(CodecError::malformed(start, MalformedReason::NonFiniteFloat));
                }
                Value::F32(v)
            }
            tags::TAG_F64 => {
                let start = self.pos;
                let v = f64::from_le_bytes(self.take_array()?);
                if !v.is_finite() {
                    return Err(CodecError::malformed(start, MalformedReason::NonFiniteFloat));
                }
                Value::F64(v)
            }
            tags::TAG_STRING => {
                let len = self.read_payload_len()?;
                Value::String(WireString::from_raw(self.take(len)?.to_vec()))
            }
            tags::TAG_BYTES => {
                let len = self.read_payload_len()?;
                Value::Bytes(self.take(len)?.to_vec())
            }
            tags::TAG_ARRAY => {
                let depth = self.enter(depth)?;
                let count = self.read_count(1)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_value(depth)?);
                }
                Value::Array(items)
            }
            tags::TAG_STRUCT => {
                let depth = self.enter(depth)?;
                // name length byte + value tag byte
                let count = self.read_count(2)?;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name_len = self.read_u8()? as usize;
                    let name_offset = self.pos;
                    let raw = self.take(name_len)?;
                    let name = std::str::from_utf8(raw)
                        .map_err(|_| CodecError::malformed(name_offset, MalformedReason::InvalidUtf8))?
                        .to_owned();
                    fields.push((name, self.read_value(depth)?));
                }
                Value::Struct(fields)
            }
            tags::TAG_ENUM => {
                let depth = self.enter(depth)?;
                let variant = self.read_u32()?;
                let payload = self.read_value(depth)?;
                Value::variant(variant, payload)
            }
            unknown => {
                return Err(CodecError::malformed(
                    tag_offset,
                    MalformedReason::UnknownTag(unknown),
                ))
            }
        };
        Ok(value)
    }
}
