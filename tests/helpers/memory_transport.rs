// ABOUTME: In-memory transport for integration tests - scripted server replies and failure injection
//
// Provides:
// - MemoryServer: a `Connector` that hands out in-process transports
// - Reply: how the server answers the next subscribe request
// - SentRequest: a decoded client frame, for assertions
// - fast_retry(): retry policy with millisecond delays

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stdb_client::codec::{self, Value};
use stdb_client::pool::{Connector, Transport, TransportError};
use stdb_client::protocol::{QueryId, RequestId, ServerMessage, SubscriptionError, TableUpdate};
use stdb_client::retry::RetryPolicy;

/// Client frame variants, as the server sees them.
pub const SUBSCRIBE_SINGLE: u32 = 2;
pub const SUBSCRIBE_MULTI: u32 = 3;
pub const UNSUBSCRIBE_MULTI: u32 = 5;

/// How the server answers one subscribe frame.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Acknowledge it
    Apply,
    /// Reject it with this message
    Error(String),
    /// Say nothing
    Silent,
}

/// A client frame the server received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub connection: usize,
    pub variant: u32,
    pub request_id: RequestId,
    pub query_id: QueryId,
    pub queries: Vec<String>,
}

#[derive(Default)]
struct ServerState {
    connects: AtomicUsize,
    failing_connects: AtomicU32,
    refuse_all: AtomicBool,
    probe_failing: AtomicBool,
    default_reply: Mutex<Option<Reply>>,
    replies: Mutex<VecDeque<Reply>>,
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
    requests: Mutex<Vec<SentRequest>>,
}

impl ServerState {
    fn next_reply(&self) -> Reply {
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        self.default_reply.lock().unwrap().clone().unwrap_or(Reply::Apply)
    }
}

/// Scripted in-process server.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until turned off.
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn set_probe_failing(&self, failing: bool) {
        self.state.probe_failing.store(failing, Ordering::SeqCst);
    }

    /// Answer used once the scripted queue is empty.
    pub fn set_default_reply(&self, reply: Reply) {
        *self.state.default_reply.lock().unwrap() = Some(reply);
    }

    /// Answer for the next subscribe frame only.
    pub fn push_reply(&self, reply: Reply) {
        self.state.replies.lock().unwrap().push_back(reply);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.state.transports.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<SentRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Subscribe frames only.
    pub fn subscribe_requests(&self) -> Vec<SentRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.variant == SUBSCRIBE_SINGLE || r.variant == SUBSCRIBE_MULTI)
            .collect()
    }

    /// Push a frame to every open transport.
    pub fn broadcast(&self, message: &ServerMessage) {
        for transport in self.transports() {
            if !transport.is_killed() {
                transport.push(message);
            }
        }
    }

    /// Push a transaction update for `table` to every open transport.
    pub fn broadcast_update(&self, table: &str, inserts: u64) {
        self.broadcast(&ServerMessage::TransactionUpdate {
            tables: vec![TableUpdate {
                table_name: table.to_string(),
                inserts,
                deletes: 0,
            }],
        });
    }

    /// Drop every open transport as if the network went away.
    pub fn kill_all(&self) {
        for transport in self.transports() {
            transport.kill();
        }
    }
}

#[async_trait]
impl Connector for MemoryServer {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let state = &self.state;
        let refused = state.refuse_all.load(Ordering::SeqCst)
            || state
                .failing_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            return Err(TransportError::Connect {
                uri: uri.to_string(),
                reason: "connection refused".into(),
            });
        }

        let index = state.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MemoryTransport {
            index,
            server: Arc::downgrade(state),
            inbox_tx: tx,
            inbox_rx: tokio::sync::Mutex::new(rx),
            killed: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        state.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// One in-process connection.
pub struct MemoryTransport {
    index: usize,
    server: std::sync::Weak<ServerState>,
    inbox_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    killed: CancellationToken,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Queue a frame for the client.
    pub fn push(&self, message: &ServerMessage) {
        let _ = self.inbox_tx.send(message.encode().unwrap());
    }

    /// Queue raw bytes for the client.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        let _ = self.inbox_tx.send(bytes);
    }

    pub fn kill(&self) {
        self.killed.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn answer(&self, server: &ServerState, request: &SentRequest) {
        let reply = server.next_reply();
        let message = match reply {
            Reply::Silent => return,
            Reply::Error(error) => ServerMessage::SubscriptionError(SubscriptionError {
                total_host_execution_duration_micros: 5,
                request_id: Some(request.request_id),
                query_id: Some(request.query_id),
                error,
            }),
            Reply::Apply if request.variant == SUBSCRIBE_SINGLE => ServerMessage::SubscribeApplied {
                request_id: request.request_id,
                total_host_execution_duration_micros: 10,
                query_id: request.query_id,
                table_name: table_of(&request.queries[0]),
            },
            Reply::Apply => ServerMessage::SubscribeMultiApplied {
                request_id: request.request_id,
                total_host_execution_duration_micros: 25,
                query_id: request.query_id,
            },
        };
        self.push(&message);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.is_killed() || self.is_closed() {
            return Err(TransportError::Closed);
        }
        let request = parse_request(self.index, &frame);
        if let Some(server) = self.server.upgrade() {
            server.requests.lock().unwrap().push(request.clone());
            if request.variant != UNSUBSCRIBE_MULTI {
                self.answer(&server, &request);
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut inbox = self.inbox_rx.lock().await;
        tokio::select! {
            () = self.killed.cancelled() => Err(TransportError::Receive("connection reset".into())),
            frame = inbox.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let failing = self
            .server
            .upgrade()
            .is_some_and(|s| s.probe_failing.load(Ordering::SeqCst));
        if failing || self.is_killed() {
            return Err(TransportError::Probe("no pong".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Decode a client frame into its request fields.
pub fn parse_request(connection: usize, frame: &[u8]) -> SentRequest {
    let value = codec::decode_exact(frame).unwrap();
    let Value::Enum { variant, payload } = &value else {
        panic!("client frame is not an enum: {value}");
    };
    let variant = *variant;
    let request_id = RequestId::new(payload.field("request_id").and_then(Value::as_u32).unwrap());
    let query_id = QueryId::new(payload.field("query_id").and_then(Value::as_u32).unwrap());
    let queries = match variant {
        SUBSCRIBE_SINGLE => vec![payload.field("query").unwrap().as_str().unwrap().to_string()],
        SUBSCRIBE_MULTI => payload
            .field("query_strings")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .map(|q| q.as_str().unwrap().to_string())
            .collect(),
        _ => Vec::new(),
    };
    SentRequest {
        connection,
        variant,
        request_id,
        query_id,
        queries,
    }
}

/// Table named after `FROM`, or `unknown`.
fn table_of(query: &str) -> String {
    let mut words = query.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("from") {
            if let Some(table) = words.next() {
                return table.trim_end_matches(';').to_string();
            }
        }
    }
    "unknown".to_string()
}

/// Retry policy with millisecond delays so tests stay fast.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(1), true, Duration::from_millis(10))
}
