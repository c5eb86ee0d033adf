// ABOUTME: Wire-level vectors for the BSATN codec and protocol frames
//
// Frames here are assembled byte by byte so the tests pin the layout the
// server actually sees, not just encode/decode agreement.

use pretty_assertions::assert_eq;

use stdb_client::codec::{self, CodecError, MalformedReason, Value};
use stdb_client::protocol::{ClientMessage, ErrorCategory, QueryId, RequestId, ServerMessage, TableUpdate};
use stdb_client::ClientError;

// === Byte helpers ===

fn field(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.push(u8::try_from(name.len()).unwrap());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(value);
}

fn u32_value(v: u32) -> Vec<u8> {
    let mut out = vec![0x07];
    out.extend_from_slice(&v.to_le_bytes());
    out
}

fn u64_value(v: u64) -> Vec<u8> {
    let mut out = vec![0x09];
    out.extend_from_slice(&v.to_le_bytes());
    out
}

fn string_value(s: &str) -> Vec<u8> {
    let mut out = vec![0x0D];
    out.extend_from_slice(&u32::try_from(s.len()).unwrap().to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out
}

/// `variant` wrapping a struct with the given already-encoded fields.
fn frame(variant: u32, fields: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut out = vec![0x13];
    out.extend_from_slice(&variant.to_le_bytes());
    out.push(0x12);
    out.extend_from_slice(&u32::try_from(fields.len()).unwrap().to_le_bytes());
    for (name, value) in fields {
        field(&mut out, name, value);
    }
    out
}

// === Scalar vectors ===

#[test]
fn test_u8_forty_two() {
    assert_eq!(codec::encode(&Value::U8(42)).unwrap(), vec![0x03, 0x2A]);
    assert_eq!(codec::decode_exact(&[0x03, 0x2A]).unwrap(), Value::U8(42));
}

#[test]
fn test_i32_array() {
    let bytes = [
        0x14, 0x02, 0x00, 0x00, 0x00, 0x08, 0x0A, 0x00, 0x00, 0x00, 0x08, 0x14, 0x00, 0x00, 0x00,
    ];
    let value = Value::Array(vec![Value::I32(10), Value::I32(20)]);
    assert_eq!(codec::encode(&value).unwrap(), bytes.to_vec());
    assert_eq!(codec::decode(&bytes).unwrap(), (value, bytes.len()));
}

#[test]
fn test_wide_integers_and_unit() {
    let value = Value::Array(vec![Value::U128(1), Value::I128(-1), Value::Unit]);
    let bytes = codec::encode(&value).unwrap();
    assert_eq!(bytes[5], 0x15);
    assert_eq!(bytes[22], 0x16);
    assert_eq!(&bytes[23..39], &[0xFF; 16]);
    assert_eq!(bytes[39], 0x10);
    assert_eq!(bytes.len(), 40);
}

// === Client frames ===

#[test]
fn test_subscribe_single_layout() {
    let message = ClientMessage::SubscribeSingle {
        query: "SELECT * FROM t".into(),
        request_id: RequestId::new(7),
        query_id: QueryId::new(3),
    };
    let expected = frame(
        2,
        &[
            ("query", string_value("SELECT * FROM t")),
            ("request_id", u32_value(7)),
            ("query_id", u32_value(3)),
        ],
    );
    assert_eq!(message.encode().unwrap(), expected);
}

#[test]
fn test_subscribe_multi_layout() {
    let message = ClientMessage::SubscribeMulti {
        query_strings: vec!["SELECT * FROM a".into(), "SELECT * FROM b".into()],
        request_id: RequestId::new(1),
        query_id: QueryId::new(2),
    };
    let mut queries = vec![0x14, 0x02, 0x00, 0x00, 0x00];
    queries.extend(string_value("SELECT * FROM a"));
    queries.extend(string_value("SELECT * FROM b"));
    let expected = frame(
        3,
        &[
            ("query_strings", queries),
            ("request_id", u32_value(1)),
            ("query_id", u32_value(2)),
        ],
    );
    assert_eq!(message.encode().unwrap(), expected);
}

#[test]
fn test_unsubscribe_layout() {
    let message = ClientMessage::UnsubscribeMulti {
        request_id: RequestId::new(9),
        query_id: QueryId::new(4),
    };
    let expected = frame(5, &[("request_id", u32_value(9)), ("query_id", u32_value(4))]);
    assert_eq!(message.encode().unwrap(), expected);
}

// === Server frames ===

#[test]
fn test_subscription_error_with_absent_request_id() {
    let bytes = frame(
        2,
        &[
            ("total_host_execution_duration_micros", u64_value(12)),
            ("request_id", vec![0x10]),
            ("query_id", u32_value(4)),
            ("error", string_value("permission denied for table t")),
        ],
    );

    let ServerMessage::SubscriptionError(err) = ServerMessage::decode(&bytes).unwrap() else {
        panic!("expected a subscription error");
    };
    assert_eq!(err.request_id, None);
    assert_eq!(err.query_id, Some(QueryId::new(4)));
    assert_eq!(err.category(), ErrorCategory::PermissionDenied);
    assert!(!err.is_transient());
}

#[test]
fn test_fields_are_matched_by_name() {
    // reordered, with a field this client does not know about
    let bytes = frame(
        0,
        &[
            ("table_name", string_value("players")),
            ("query_id", u32_value(5)),
            ("server_version", string_value("2.1")),
            ("request_id", u32_value(11)),
            ("total_host_execution_duration_micros", u64_value(40)),
        ],
    );
    assert_eq!(
        ServerMessage::decode(&bytes).unwrap(),
        ServerMessage::SubscribeApplied {
            request_id: RequestId::new(11),
            total_host_execution_duration_micros: 40,
            query_id: QueryId::new(5),
            table_name: "players".into(),
        }
    );
}

#[test]
fn test_transaction_update_tables() {
    let mut table = vec![0x12, 0x03, 0x00, 0x00, 0x00];
    field(&mut table, "table_name", &string_value("players"));
    field(&mut table, "inserts", &u64_value(2));
    field(&mut table, "deletes", &u64_value(1));
    let mut tables = vec![0x14, 0x01, 0x00, 0x00, 0x00];
    tables.extend(table);

    let message = ServerMessage::decode(&frame(4, &[("tables", tables)])).unwrap();
    assert_eq!(
        message,
        ServerMessage::TransactionUpdate {
            tables: vec![TableUpdate {
                table_name: "players".into(),
                inserts: 2,
                deletes: 1,
            }],
        }
    );
    assert_eq!(message.request_id(), None);
}

#[test]
fn test_unknown_variant_is_not_an_error() {
    let bytes = [0x13, 0x09, 0x00, 0x00, 0x00, 0x10];
    assert_eq!(ServerMessage::decode(&bytes).unwrap(), ServerMessage::Unknown(9));
}

// === Malformed input ===

#[test]
fn test_missing_field_is_malformed() {
    let bytes = frame(1, &[("request_id", u32_value(1))]);
    let err = ServerMessage::decode(&bytes).unwrap_err();
    assert!(matches!(
        err,
        CodecError::MalformedInput {
            reason: MalformedReason::UnexpectedShape(_),
            ..
        }
    ));
    assert!(ClientError::from(err).is_malformed_input());
}

#[test]
fn test_non_enum_frame_is_malformed() {
    let err = ServerMessage::decode(&[0x03, 0x2A]).unwrap_err();
    assert!(err.is_malformed());
}

#[test]
fn test_truncated_frame_reports_offset() {
    let bytes = frame(
        3,
        &[("request_id", u32_value(1)), ("query_id", u32_value(2))],
    );
    for cut in 1..bytes.len() {
        let err = ServerMessage::decode(&bytes[..cut]).unwrap_err();
        let CodecError::MalformedInput { offset, .. } = err else {
            panic!("cut at {cut} gave {err}");
        };
        assert!(offset <= cut, "offset {offset} past cut {cut}");
    }
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut bytes = frame(3, &[("request_id", u32_value(1)), ("query_id", u32_value(2))]);
    bytes.push(0x00);
    assert!(matches!(
        ServerMessage::decode(&bytes),
        Err(CodecError::MalformedInput {
            reason: MalformedReason::TrailingBytes(1),
            ..
        })
    ));
}

#[test]
fn test_unknown_tag_byte_rejected() {
    assert!(matches!(
        codec::decode(&[0xEE]),
        Err(CodecError::MalformedInput {
            offset: 0,
            reason: MalformedReason::UnknownTag(0xEE),
        })
    ));
}
