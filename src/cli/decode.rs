// ABOUTME: CLI decode command - hex frame to value tree or server message

use anyhow::{bail, Context, Result};
use serde_json::json;

use stdb_client::codec::{self, Value};
use stdb_client::protocol::ServerMessage;

use super::{DecodeArgs, OutputFormat};

pub fn execute(args: &DecodeArgs, format: OutputFormat) -> Result<()> {
    let bytes = parse_hex(&args.hex)?;
    let value = codec::decode_exact(&bytes).context("frame does not decode")?;
    tracing::debug!(bytes = bytes.len(), tag = value.tag(), "Decoded frame");

    if args.server {
        let message = ServerMessage::from_value(&value).context("not a server message")?;
        match format {
            OutputFormat::Text => println!("{message:#?}"),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&to_json(&value))?),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Text => println!("{value}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&to_json(&value))?),
    }
    Ok(())
}

/// Parse hex digits, ignoring whitespace and an optional `0x` prefix.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !digits.is_ascii() {
        bail!("hex input contains non-ASCII characters");
    }
    if digits.len() % 2 != 0 {
        bail!("hex input has an odd number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte `{}`", &digits[i..i + 2]))
        })
        .collect()
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

/// JSON view of a value; 128-bit integers become strings.
fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Unit => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::I8(n) => json!(n),
        Value::U8(n) => json!(n),
        Value::I16(n) => json!(n),
        Value::U16(n) => json!(n),
        Value::I32(n) => json!(n),
        Value::U32(n) => json!(n),
        Value::I64(n) => json!(n),
        Value::U64(n) => json!(n),
        Value::I128(n) => json!(n.to_string()),
        Value::U128(n) => json!(n.to_string()),
        Value::F32(n) => json!(n),
        Value::F64(n) => json!(n),
        Value::String(s) => match s.as_str() {
            Ok(text) => json!(text),
            Err(_) => json!({ "invalid_utf8": to_hex(s.as_bytes()) }),
        },
        Value::Bytes(b) => json!(to_hex(b)),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Struct(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(name, field)| (name.clone(), to_json(field)))
                .collect(),
        ),
        Value::Enum { variant, payload } => json!({ "variant": variant, "payload": to_json(payload) }),
    }
}
