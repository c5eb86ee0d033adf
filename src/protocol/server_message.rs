// ABOUTME: Inbound frames - subscription acknowledgments, errors and transaction updates
//
// Frames are enum-wrapped structs. Fields are looked up by name so the server
// may add fields without breaking older clients; optional ids use `unit` for
// absence.

use std::fmt;

use crate::codec::{self, CodecError, CodecResult, Value};

use super::ids::{QueryId, RequestId};

pub const VARIANT_SUBSCRIBE_APPLIED: u32 = 0;
pub const VARIANT_SUBSCRIBE_MULTI_APPLIED: u32 = 1;
pub const VARIANT_SUBSCRIPTION_ERROR: u32 = 2;
pub const VARIANT_UNSUBSCRIBE_APPLIED: u32 = 3;
pub const VARIANT_TRANSACTION_UPDATE: u32 = 4;

/// Coarse classification of a server-side subscription error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    QueryParse,
    PermissionDenied,
    Timeout,
    ResourceExhausted,
    Internal,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::QueryParse => "query_parse_error",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout_error",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Internal => "internal_error",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Server-reported failure of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionError {
    pub total_host_execution_duration_micros: u64,
    pub request_id: Option<RequestId>,
    pub query_id: Option<QueryId>,
    pub error: String,
}

impl SubscriptionError {
    /// Classify by keywords in the server's message.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        let text = self.error.to_lowercase();
        if text.contains("parse") || text.contains("syntax") {
            ErrorCategory::QueryParse
        } else if text.contains("permission") || text.contains("denied") {
            ErrorCategory::PermissionDenied
        } else if text.contains("timeout") {
            ErrorCategory::Timeout
        } else if text.contains("resource") || text.contains("exhausted") {
            ErrorCategory::ResourceExhausted
        } else if text.contains("internal") {
            ErrorCategory::Internal
        } else {
            ErrorCategory::Unknown
        }
    }

    /// Transient categories a caller might reasonably try again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Timeout | ErrorCategory::ResourceExhausted | ErrorCategory::Internal
        )
    }
}

/// Row counts for one table inside a transaction update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUpdate {
    pub table_name: String,
    pub inserts: u64,
    pub deletes: u64,
}

/// A frame pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    SubscribeApplied {
        request_id: RequestId,
        total_host_execution_duration_micros: u64,
        query_id: QueryId,
        table_name: String,
    },
    SubscribeMultiApplied {
        request_id: RequestId,
        total_host_execution_duration_micros: u64,
        query_id: QueryId,
    },
    SubscriptionError(SubscriptionError),
    UnsubscribeApplied {
        request_id: RequestId,
        query_id: QueryId,
    },
    TransactionUpdate {
        tables: Vec<TableUpdate>,
    },
    /// Variant this client does not understand; ignored by consumers
    Unknown(u32),
}

impl ServerMessage {
    /// Decode one complete frame.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(&codec::decode_exact(bytes)?)
    }

    /// Interpret an already decoded value as a server frame.
    pub fn from_value(value: &Value) -> CodecResult<Self> {
        let Value::Enum { variant, payload } = value else {
            return Err(CodecError::shape("server frame is not an enum"));
        };
        let body = payload.as_ref();
        let message = match *variant {
            VARIANT_SUBSCRIBE_APPLIED => Self::SubscribeApplied {
                request_id: RequestId::new(req_u32(body, "request_id")?),
                total_host_execution_duration_micros: duration(body)?,
                query_id: QueryId::new(req_u32(body, "query_id")?),
                table_name: req_string(body, "table_name")?,
            },
            VARIANT_SUBSCRIBE_MULTI_APPLIED => Self::SubscribeMultiApplied {
                request_id: RequestId::new(req_u32(body, "request_id")?),
                total_host_execution_duration_micros: duration(body)?,
                query_id: QueryId::new(req_u32(body, "query_id")?),
            },
            VARIANT_SUBSCRIPTION_ERROR => Self::SubscriptionError(SubscriptionError {
                total_host_execution_duration_micros: duration(body)?,
                request_id: opt_u32(body, "request_id")?.map(RequestId::new),
                query_id: opt_u32(body, "query_id")?.map(QueryId::new),
                error: req_string(body, "error")?,
            }),
            VARIANT_UNSUBSCRIBE_APPLIED => Self::UnsubscribeApplied {
                request_id: RequestId::new(req_u32(body, "request_id")?),
                query_id: QueryId::new(req_u32(body, "query_id")?),
            },
            VARIANT_TRANSACTION_UPDATE => {
                let tables = required(body, "tables")?
                    .as_array()
                    .ok_or_else(|| CodecError::shape("field `tables` is not an array"))?
                    .iter()
                    .map(|table| {
                        Ok(TableUpdate {
                            table_name: req_string(table, "table_name")?,
                            inserts: req_u64(table, "inserts")?,
                            deletes: req_u64(table, "deletes")?,
                        })
                    })
                    .collect::<CodecResult<Vec<_>>>()?;
                Self::TransactionUpdate { tables }
            }
            other => Self::Unknown(other),
        };
        Ok(message)
    }

    /// Tagged value form of the frame (used by test servers and the probe CLI).
    #[must_use]
    pub fn to_value(&self) -> Value {
        let (variant, body) = match self {
            Self::SubscribeApplied {
                request_id,
                total_host_execution_duration_micros,
                query_id,
                table_name,
            } => (
                VARIANT_SUBSCRIBE_APPLIED,
                Value::structure([
                    ("request_id", Value::U32(request_id.get())),
                    (
                        "total_host_execution_duration_micros",
                        Value::U64(*total_host_execution_duration_micros),
                    ),
                    ("query_id", Value::U32(query_id.get())),
                    ("table_name", Value::string(table_name.as_str())),
                ]),
            ),
            Self::SubscribeMultiApplied {
                request_id,
                total_host_execution_duration_micros,
                query_id,
            } => (
                VARIANT_SUBSCRIBE_MULTI_APPLIED,
                Value::structure([
                    ("request_id", Value::U32(request_id.get())),
                    (
                        "total_host_execution_duration_micros",
                        Value::U64(*total_host_execution_duration_micros),
                    ),
                    ("query_id", Value::U32(query_id.get())),
                ]),
            ),
            Self::SubscriptionError(err) => (
                VARIANT_SUBSCRIPTION_ERROR,
                Value::structure([
                    (
                        "total_host_execution_duration_micros",
                        Value::U64(err.total_host_execution_duration_micros),
                    ),
                    (
                        "request_id",
                        err.request_id.map_or(Value::Unit, |id| Value::U32(id.get())),
                    ),
                    (
                        "query_id",
                        err.query_id.map_or(Value::Unit, |id| Value::U32(id.get())),
                    ),
                    ("error", Value::string(err.error.as_str())),
                ]),
            ),
            Self::UnsubscribeApplied {
                request_id,
                query_id,
            } => (
                VARIANT_UNSUBSCRIBE_APPLIED,
                Value::structure([
                    ("request_id", Value::U32(request_id.get())),
                    ("query_id", Value::U32(query_id.get())),
                ]),
            ),
            Self::TransactionUpdate { tables } => (
                VARIANT_TRANSACTION_UPDATE,
                Value::structure([(
                    "tables",
                    Value::Array(
                        tables
                            .iter()
                            .map(|t| {
                                Value::structure([
                                    ("table_name", Value::string(t.table_name.as_str())),
                                    ("inserts", Value::U64(t.inserts)),
                                    ("deletes", Value::U64(t.deletes)),
                                ])
                            })
                            .collect(),
                    ),
                )]),
            ),
            Self::Unknown(variant) => (*variant, Value::Unit),
        };
        Value::variant(variant, body)
    }

    /// Encode the frame to wire bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        codec::encode(&self.to_value())
    }

    /// Request id this frame answers, if any.
    #[must_use]
    pub const fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::SubscribeApplied { request_id, .. }
            | Self::SubscribeMultiApplied { request_id, .. }
            | Self::UnsubscribeApplied { request_id, .. } => Some(*request_id),
            Self::SubscriptionError(err) => err.request_id,
            Self::TransactionUpdate { .. } | Self::Unknown(_) => None,
        }
    }
}

// === Field helpers ===

fn required<'a>(body: &'a Value, name: &str) -> CodecResult<&'a Value> {
    body.field(name)
        .ok_or_else(|| CodecError::shape(format!("missing field `{name}`")))
}

fn req_u32(body: &Value, name: &str) -> CodecResult<u32> {
    required(body, name)?
        .as_u32()
        .ok_or_else(|| CodecError::shape(format!("field `{name}` is not u32")))
}

fn req_u64(body: &Value, name: &str) -> CodecResult<u64> {
    required(body, name)?
        .as_u64()
        .ok_or_else(|| CodecError::shape(format!("field `{name}` is not u64")))
}

fn opt_u32(body: &Value, name: &str) -> CodecResult<Option<u32>> {
    match body.field(name) {
        None | Some(Value::Unit) => Ok(None),
        Some(Value::U32(v)) => Ok(Some(*v)),
        Some(_) => Err(CodecError::shape(format!("field `{name}` is not u32 or unit"))),
    }
}

fn req_string(body: &Value, name: &str) -> CodecResult<String> {
    Ok(required(body, name)?.as_str()?.to_owned())
}

fn duration(body: &Value) -> CodecResult<u64> {
    // older servers omit the timing field
    match body.field("total_host_execution_duration_micros") {
        None => Ok(0),
        Some(v) => v.as_u64().ok_or_else(|| {
            CodecError::shape("field `total_host_execution_duration_micros` is not u64")
        }),
    }
}
