// ABOUTME: The tagged value model carried by every BSATN frame
//
// A closed union over primitives, strings, byte strings, arrays, ordered
// structs and enums. Strings keep their raw bytes so malformed UTF-8 only
// fails when a consumer asks for `&str`.

use std::fmt;

use super::error::{CodecError, MalformedReason};
use super::tags;

/// String payload as it travels on the wire.
///
/// UTF-8 is validated lazily by [`WireString::as_str`].
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct WireString(Vec<u8>);

impl WireString {
    /// Wrap raw bytes without validation.
    #[must_use]
    pub const fn from_raw(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Materialize as `&str`, failing on invalid UTF-8.
    pub fn as_str(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(&self.0)
            .map_err(|_| CodecError::malformed(0, MalformedReason::InvalidUtf8))
    }

    /// Byte length of the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for WireString {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for WireString {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Debug for WireString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// A self-describing value; each variant maps to one tag byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    I128(i128),
    U128(u128),
    F32(f32),
    F64(f64),
    String(WireString),
    Bytes(Vec<u8>),
    /// Elements each carry their own tag, so mixed arrays are legal
    Array(Vec<Value>),
    /// Field order is significant and preserved
    Struct(Vec<(String, Value)>),
    /// Sum-type variant index with a single payload
    Enum {
        /// Variant index
        variant: u32,
        /// Variant payload (`Unit` for payload-less variants)
        payload: Box<Value>,
    },
}

impl Value {
    /// Build a string value.
    pub fn string(value: impl Into<WireString>) -> Self {
        Self::String(value.into())
    }

    /// Build a struct value from `(name, value)` pairs, keeping their order.
    pub fn structure<N, I>(fields: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Self)>,
    {
        Self::Struct(
            fields
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }

    /// Build an enum value.
    #[must_use]
    pub fn variant(variant: u32, payload: Self) -> Self {
        Self::Enum {
            variant,
            payload: Box::new(payload),
        }
    }

    /// Tag byte this value is encoded with.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Unit => tags::TAG_UNIT,
            Self::Bool(false) => tags::TAG_BOOL_FALSE,
            Self::Bool(true) => tags::TAG_BOOL_TRUE,
            Self::I8(_) => tags::TAG_I8,
            Self::U8(_) => tags::TAG_U8,
            Self::I16(_) => tags::TAG_I16,
            Self::U16(_) => tags::TAG_U16,
            Self::I32(_) => tags::TAG_I32,
            Self::U32(_) => tags::TAG_U32,
            Self::I64(_) => tags::TAG_I64,
            Self::U64(_) => tags::TAG_U64,
            Self::I128(_) => tags::TAG_I128,
            Self::U128(_) => tags::TAG_U128,
            Self::F32(_) => tags::TAG_F32,
            Self::F64(_) => tags::TAG_F64,
            Self::String(_) => tags::TAG_STRING,
            Self::Bytes(_) => tags::TAG_BYTES,
            Self::Array(_) => tags::TAG_ARRAY,
            Self::Struct(_) => tags::TAG_STRUCT,
            Self::Enum { .. } => tags::TAG_ENUM,
        }
    }

    /// Look up a struct field by name (first match wins).
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Self> {
        match self {
            Self::Struct(fields) => fields
                .iter()
                .find(|(field_name, _)| field_name == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow a string payload as `&str` (fails on non-strings or bad UTF-8).
    pub fn as_str(&self) -> Result<&str, CodecError> {
        match self {
            Self::String(text) => text.as_str(),
            other => Err(CodecError::shape(format!(
                "expected string, found {}",
                tags::tag_name(other.tag())
            ))),
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::U32(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::string(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "()"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}i8"),
            Self::U8(v) => write!(f, "{v}u8"),
            Self::I16(v) => write!(f, "{v}i16"),
            Self::U16(v) => write!(f, "{v}u16"),
            Self::I32(v) => write!(f, "{v}i32"),
            Self::U32(v) => write!(f, "{v}u32"),
            Self::I64(v) => write!(f, "{v}i64"),
            Self::U64(v) => write!(f, "{v}u64"),
            Self::I128(v) => write!(f, "{v}i128"),
            Self::U128(v) => write!(f, "{v}u128"),
            Self::F32(v) => write!(f, "{v}f32"),
            Self::F64(v) => write!(f, "{v}f64"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
            Self::Enum { variant, payload } => write!(f, "#{variant}({payload})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_matches_variant() {
        assert_eq!(Value::U8(42).tag(), 0x03);
        assert_eq!(Value::Bool(true).tag(), 0x02);
        assert_eq!(Value::Bool(false).tag(), 0x01);
        assert_eq!(Value::Array(vec![]).tag(), 0x14);
        assert_eq!(Value::Unit.tag(), 0x10);
    }

    #[test]
    fn test_field_lookup_preserves_first_match() {
        let value = Value::structure([("a", Value::U32(1)), ("b", Value::U32(2)), ("a", Value::U32(3))]);
        assert_eq!(value.field("a"), Some(&Value::U32(1)));
        assert_eq!(value.field("b"), Some(&Value::U32(2)));
        assert!(value.field("c").is_none());
    }

    #[test]
    fn test_wire_string_lazy_utf8() {
        let bad = WireString::from_raw(vec![0xFF, 0xFE]);
        assert_eq!(bad.len(), 2);
        assert!(bad.as_str().is_err());

        let good = WireString::from("hello");
        assert_eq!(good.as_str().unwrap(), "hello");
    }

    #[test]
    fn test_display_renders_nested_values() {
        let value = Value::variant(
            2,
            Value::structure([("query", Value::from("SELECT 1")), ("ids", Value::Array(vec![Value::U32(7)]))]),
        );
        assert_eq!(value.to_string(), "#2({query: \"SELECT 1\", ids: [7u32]})");
    }
}
