// ABOUTME: BSATN binary codec - tagged values to and from little-endian frames
//
// `encode`/`decode` are the entry points; `Encoder`/`Decoder` expose the
// buffer-reuse and limit knobs.

pub mod error;
pub mod reader;
pub mod tags;
pub mod value;
pub mod writer;

pub use error::{CodecError, CodecResult, MalformedReason};
pub use reader::Decoder;
pub use value::{Value, WireString};
pub use writer::Encoder;

/// Encode a single value into a fresh buffer.
pub fn encode(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = Encoder::new();
    encoder.write(value)?;
    Ok(encoder.into_bytes())
}

/// Encode a value onto the end of `buf`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) -> CodecResult<()> {
    let mut encoder = Encoder::with_capacity(64);
    encoder.write(value)?;
    buf.extend_from_slice(&encoder.into_bytes());
    Ok(())
}

/// Decode one value from the front of `bytes` with default limits.
pub fn decode(bytes: &[u8]) -> CodecResult<(Value, usize)> {
    Decoder::new().decode(bytes)
}

/// Decode a value that must consume the whole buffer.
pub fn decode_exact(bytes: &[u8]) -> CodecResult<Value> {
    Decoder::new().decode_exact(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_values() -> Vec<Value> {
        vec![
            Value::Unit,
            Value::Bool(true),
            Value::Bool(false),
            Value::I8(-5),
            Value::U8(200),
            Value::I16(-300),
            Value::U16(60_000),
            Value::I32(i32::MIN),
            Value::U32(u32::MAX),
            Value::I64(-1),
            Value::U64(u64::MAX),
            Value::I128(i128::MIN),
            Value::U128(u128::MAX),
            Value::F32(1.5),
            Value::F64(-0.25),
            Value::string(""),
            Value::string("héllo"),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Array(vec![]),
            Value::Array(vec![Value::U8(1), Value::string("mixed"), Value::Unit]),
            Value::structure([
                ("id", Value::U32(7)),
                ("tags", Value::Array(vec![Value::string("a")])),
                ("inner", Value::structure([("flag", Value::Bool(true))])),
            ]),
            Value::variant(3, Value::structure([("x", Value::I64(9))])),
        ]
    }

    #[test]
    fn test_u8_vector() {
        assert_eq!(encode(&Value::U8(42)).unwrap(), vec![0x03, 0x2A]);
    }

    #[test]
    fn test_i32_array_vector() {
        let value = Value::Array(vec![Value::I32(10), Value::I32(20)]);
        assert_eq!(
            encode(&value).unwrap(),
            vec![
                0x14, 0x02, 0x00, 0x00, 0x00, 0x08, 0x0A, 0x00, 0x00, 0x00, 0x08, 0x14, 0x00,
                0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_round_trip_consumes_everything() {
        for value in sample_values() {
            let bytes = encode(&value).unwrap();
            let (decoded, consumed) = decode(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_truncated_prefixes_fail_cleanly() {
        for value in sample_values() {
            let bytes = encode(&value).unwrap();
            for cut in 0..bytes.len() {
                let err = decode(&bytes[..cut]).unwrap_err();
                assert!(err.is_malformed(), "prefix {cut} of {value} decoded");
            }
        }
    }

    #[test]
    fn test_decode_stops_at_value_boundary() {
        let mut buf = Vec::new();
        encode_into(&Value::U8(1), &mut buf).unwrap();
        encode_into(&Value::string("next"), &mut buf).unwrap();

        let (first, consumed) = decode(&buf).unwrap();
        assert_eq!(first, Value::U8(1));
        assert_eq!(consumed, 2);
        assert_eq!(decode_exact(&buf[consumed..]).unwrap(), Value::string("next"));
    }
}
