// ABOUTME: Outbound frames - subscribe/unsubscribe requests as enum-wrapped structs

use crate::codec::{self, CodecResult, Value};

use super::ids::{QueryId, RequestId};

/// Variant index of a single-query subscribe frame.
pub const VARIANT_SUBSCRIBE_SINGLE: u32 = 2;
/// Variant index of a batched subscribe frame.
pub const VARIANT_SUBSCRIBE_MULTI: u32 = 3;
/// Variant index of an unsubscribe frame.
pub const VARIANT_UNSUBSCRIBE_MULTI: u32 = 5;

/// A request the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SubscribeSingle {
        query: String,
        request_id: RequestId,
        query_id: QueryId,
    },
    SubscribeMulti {
        query_strings: Vec<String>,
        request_id: RequestId,
        query_id: QueryId,
    },
    UnsubscribeMulti {
        request_id: RequestId,
        query_id: QueryId,
    },
}

impl ClientMessage {
    /// Request id carried by the frame.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::SubscribeSingle { request_id, .. }
            | Self::SubscribeMulti { request_id, .. }
            | Self::UnsubscribeMulti { request_id, .. } => *request_id,
        }
    }

    /// Tagged value form of the frame.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::SubscribeSingle {
                query,
                request_id,
                query_id,
            } => Value::variant(
                VARIANT_SUBSCRIBE_SINGLE,
                Value::structure([
                    ("query", Value::string(query.as_str())),
                    ("request_id", Value::U32(request_id.get())),
                    ("query_id", Value::U32(query_id.get())),
                ]),
            ),
            Self::SubscribeMulti {
                query_strings,
                request_id,
                query_id,
            } => Value::variant(
                VARIANT_SUBSCRIBE_MULTI,
                Value::structure([
                    (
                        "query_strings",
                        Value::Array(
                            query_strings
                                .iter()
                                .map(|q| Value::string(q.as_str()))
                                .collect(),
                        ),
                    ),
                    ("request_id", Value::U32(request_id.get())),
                    ("query_id", Value::U32(query_id.get())),
                ]),
            ),
            Self::UnsubscribeMulti {
                request_id,
                query_id,
            } => Value::variant(
                VARIANT_UNSUBSCRIBE_MULTI,
                Value::structure([
                    ("request_id", Value::U32(request_id.get())),
                    ("query_id", Value::U32(query_id.get())),
                ]),
            ),
        }
    }

    /// Encode the frame to wire bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        codec::encode(&self.to_value())
    }
}
