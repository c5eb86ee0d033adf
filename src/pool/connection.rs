// ABOUTME: Pooled connection internals - ids, lifecycle states, frame fan-out and leases
//
// Each established transport gets one reader task that pulls frames and
// broadcasts them, so several subscriptions multiplexed on one connection all
// see every inbound frame. Callers hold a `ConnectionHandle` lease; dropping
// it returns the lease to the pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::{Transport, TransportError};
use super::PoolShared;

/// Frames buffered per connection before slow consumers start lagging.
const FRAME_BUFFER: usize = 256;

/// Identifies one pool slot for its whole lifetime (reconnects keep the id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a pooled connection.
///
/// `Connecting -> Healthy <-> Degraded -> CircuitOpen -> Connecting -> ... -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Healthy,
    Degraded,
    CircuitOpen,
    /// Terminal; the slot is removed on the next health cycle
    Closed,
}

impl ConnectionState {
    /// May be handed out by `acquire()`.
    #[must_use]
    pub const fn is_selectable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Counts toward the live connection total.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::CircuitOpen => "circuit_open",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Event delivered to frame subscribers.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// One complete frame from the server
    Frame(Arc<[u8]>),
    /// The reader stopped; no more frames will arrive
    Closed(TransportError),
}

// === Pooled Connection ===

/// An established transport plus its reader task.
pub(crate) struct PooledConnection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    frames: broadcast::Sender<Inbound>,
    closed: Arc<AtomicBool>,
    reader: CancellationToken,
}

impl PooledConnection {
    /// Wrap a fresh transport and start its reader task.
    pub(crate) fn open(id: ConnectionId, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));
        let reader = CancellationToken::new();

        tokio::spawn(read_loop(
            id,
            Arc::clone(&transport),
            frames.clone(),
            Arc::clone(&closed),
            reader.clone(),
        ));

        Arc::new(Self {
            id,
            transport,
            frames,
            closed,
            reader,
        })
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the reader and close the transport.
    pub(crate) async fn shutdown(&self) {
        self.reader.cancel();
        if !self.closed.swap(true, Ordering::AcqRel) {
            // leaseholders still listening learn the connection is gone
            let _ = self.frames.send(Inbound::Closed(TransportError::Closed));
        }
        self.transport.close().await;
        debug!(connection = %self.id, "Connection closed");
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.reader.cancel();
    }
}

async fn read_loop(
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    frames: broadcast::Sender<Inbound>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = transport.receive() => match received {
                Ok(bytes) => {
                    // no subscribers is fine; the frame is simply unclaimed
                    let _ = frames.send(Inbound::Frame(bytes.into()));
                }
                Err(err) => {
                    debug!(connection = %id, error = %err, "Reader stopped");
                    if !closed.swap(true, Ordering::AcqRel) {
                        let _ = frames.send(Inbound::Closed(err));
                    }
                    break;
                }
            }
        }
    }
}

// === Connection Handle ===

/// A lease on one pooled connection.
///
/// Return it with [`super::ConnectionPool::release`] or
/// [`super::ConnectionPool::report_failure`]; dropping it releases it.
pub struct ConnectionHandle {
    id: ConnectionId,
    conn: Arc<PooledConnection>,
    pool: Weak<PoolShared>,
    returned: bool,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, conn: Arc<PooledConnection>, pool: Weak<PoolShared>) -> Self {
        Self {
            id,
            conn,
            pool,
            returned: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send one frame on the leased connection.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.sender().send(frame).await
    }

    /// Subscribe to inbound frames. Subscribe before sending a request so
    /// the reply cannot slip past.
    #[must_use]
    pub fn frames(&self) -> broadcast::Receiver<Inbound> {
        self.conn.frames.subscribe()
    }

    /// True once the reader saw the transport close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Cloneable send side of this lease, usable while the handle itself is
    /// parked elsewhere.
    #[must_use]
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            id: self.id,
            conn: Arc::clone(&self.conn),
        }
    }

    /// Hand the lease back, counting a request failure if `failed`.
    pub(crate) fn finish(mut self, failed: bool) {
        self.give_back(failed);
    }

    fn give_back(&mut self, failed: bool) {
        if self.returned {
            return;
        }
        self.returned = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.return_lease(self.id, failed);
        }
    }
}

/// Send-only view of a leased connection. Does not hold the lease.
#[derive(Clone)]
pub struct FrameSender {
    id: ConnectionId,
    conn: Arc<PooledConnection>,
}

impl FrameSender {
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.conn.is_closed() {
            return Err(TransportError::Closed);
        }
        self.conn.transport().send(frame).await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.conn.is_closed())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.give_back(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::transport::testing::IdleTransport;
    use crate::pool::transport::MockTransport;

    #[tokio::test]
    async fn test_shutdown_is_broadcast_to_listeners() {
        let transport = Arc::new(IdleTransport::default());
        let conn = PooledConnection::open(ConnectionId::new(1), Arc::clone(&transport) as Arc<dyn Transport>);
        let mut frames = conn.frames.subscribe();
        let sender = FrameSender {
            id: conn.id,
            conn: Arc::clone(&conn),
        };

        conn.shutdown().await;

        assert!(matches!(frames.recv().await, Ok(Inbound::Closed(TransportError::Closed))));
        assert_eq!(sender.send(vec![1]).await, Err(TransportError::Closed));
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let mut transport = MockTransport::new();
        transport
            .expect_receive()
            .returning(|| Err(TransportError::Receive("reset".into())));
        transport.expect_close().times(1).returning(|| ());

        let conn = PooledConnection::open(ConnectionId::new(2), Arc::new(transport));
        conn.shutdown().await;
        assert!(conn.is_closed());
    }

    #[test]
    fn test_connection_state_selectable() {
        assert!(ConnectionState::Healthy.is_selectable());
        assert!(ConnectionState::Degraded.is_selectable());
        assert!(!ConnectionState::CircuitOpen.is_selectable());
        assert!(ConnectionState::CircuitOpen.is_live());
        assert!(!ConnectionState::Closed.is_live());
        assert_eq!(ConnectionId::new(4).to_string(), "conn-4");
    }
}
