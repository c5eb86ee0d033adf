// ABOUTME: One-byte type tags for the BSATN wire format plus payload limits
//
// Every encoded value starts with exactly one of these bytes. The values are
// fixed by the server protocol and must never be renumbered.

/// `false` (the tag is the whole value)
pub const TAG_BOOL_FALSE: u8 = 0x01;
/// `true` (the tag is the whole value)
pub const TAG_BOOL_TRUE: u8 = 0x02;
pub const TAG_U8: u8 = 0x03;
pub const TAG_I8: u8 = 0x04;
pub const TAG_U16: u8 = 0x05;
pub const TAG_I16: u8 = 0x06;
pub const TAG_U32: u8 = 0x07;
pub const TAG_I32: u8 = 0x08;
pub const TAG_U64: u8 = 0x09;
pub const TAG_I64: u8 = 0x0A;
pub const TAG_F32: u8 = 0x0B;
pub const TAG_F64: u8 = 0x0C;
/// u32 LE length + UTF-8 bytes
pub const TAG_STRING: u8 = 0x0D;
/// u32 LE length + raw bytes
pub const TAG_BYTES: u8 = 0x0E;
/// No payload
pub const TAG_UNIT: u8 = 0x10;
/// u32 LE field count, then per field: u8 name length + name + tagged value
pub const TAG_STRUCT: u8 = 0x12;
/// u32 LE variant index + one tagged payload
pub const TAG_ENUM: u8 = 0x13;
/// u32 LE element count, then fully tagged elements
pub const TAG_ARRAY: u8 = 0x14;
pub const TAG_U128: u8 = 0x15;
pub const TAG_I128: u8 = 0x16;

/// Largest string or byte-string payload accepted in either direction (1 MiB).
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Longest struct field name; the length travels in a single byte.
pub const MAX_FIELD_NAME_LEN: usize = u8::MAX as usize;

/// Default nesting bound for array/struct/enum containers while decoding.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Human-readable tag name for diagnostics.
pub const fn tag_name(tag: u8) -> &'static str {
    match tag {
        TAG_BOOL_FALSE | TAG_BOOL_TRUE => "bool",
        TAG_U8 => "u8",
        TAG_I8 => "i8",
        TAG_U16 => "u16",
        TAG_I16 => "i16",
        TAG_U32 => "u32",
        TAG_I32 => "i32",
        TAG_U64 => "u64",
        TAG_I64 => "i64",
        TAG_F32 => "f32",
        TAG_F64 => "f64",
        TAG_STRING => "string",
        TAG_BYTES => "bytes",
        TAG_UNIT => "unit",
        TAG_STRUCT => "struct",
        TAG_ENUM => "enum",
        TAG_ARRAY => "array",
        TAG_U128 => "u128",
        TAG_I128 => "i128",
        _ => "unknown",
    }
}
