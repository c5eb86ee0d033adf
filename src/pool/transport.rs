// ABOUTME: Transport collaborator traits - the byte-stream connection the pool manages
//
// The pool never speaks TLS or HTTP upgrade itself; a `Connector` hands it a
// ready `Transport` for a URI and frame boundaries are the transport's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect to {uri} failed: {reason}")]
    Connect { uri: String, reason: String },

    #[error("connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// One established, framed, bidirectional connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one complete frame.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Wait for the next complete frame.
    ///
    /// Only the pool's reader task calls this; callers consume frames through
    /// [`super::ConnectionHandle::frames`].
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    /// Lightweight liveness check (ping).
    async fn probe(&self) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Opens transports for a URI.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{Transport, TransportError};

    /// Transport that never receives a frame; probes follow `healthy`.
    #[derive(Default)]
    pub(crate) struct IdleTransport {
        pub(crate) healthy: Arc<AtomicBool>,
        pub(crate) sent: AtomicUsize,
    }

    impl IdleTransport {
        pub(crate) fn new(healthy: Arc<AtomicBool>) -> Self {
            Self {
                healthy,
                sent: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for IdleTransport {
        async fn send(&self, _frame: Vec<u8>) -> Result<(), TransportError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn receive(&self) -> Result<Vec<u8>, TransportError> {
            std::future::pending().await
        }

        async fn probe(&self) -> Result<(), TransportError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::Probe("down".into()))
            }
        }

        async fn close(&self) {}
    }
}
